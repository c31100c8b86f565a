use crate::hardware::HardwareError;

/// Two relays that must never be energized together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterlockGroup {
    pub a: String,
    pub b: String,
}

impl InterlockGroup {
    /// The other member of the pair, if `relay` belongs to it.
    pub fn partner_of(&self, relay: &str) -> Option<&str> {
        if self.a == relay {
            Some(&self.b)
        } else if self.b == relay {
            Some(&self.a)
        } else {
            None
        }
    }
}

/// Pre-emptive interlocks: activating one member switches its partner OFF
/// first. Activation is never refused.
#[derive(Debug, Clone, Default)]
pub struct InterlockPolicy {
    groups: Vec<InterlockGroup>,
}

impl InterlockPolicy {
    pub fn new<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
        is_relay: impl Fn(&str) -> bool,
    ) -> Result<Self, HardwareError> {
        let mut groups = Vec::new();
        for (a, b) in pairs {
            for name in [a, b] {
                if !is_relay(name) {
                    return Err(HardwareError::UnknownChannel(name.to_string()));
                }
            }
            groups.push(InterlockGroup {
                a: a.to_string(),
                b: b.to_string(),
            });
        }
        Ok(Self { groups })
    }

    /// Relays that must be OFF before `relay` may turn ON.
    pub fn partners<'a>(&'a self, relay: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.groups.iter().filter_map(move |g| g.partner_of(relay))
    }

    /// True when no group has both members ON.
    pub fn is_satisfied(&self, is_on: impl Fn(&str) -> bool) -> bool {
        self.groups.iter().all(|g| !(is_on(&g.a) && is_on(&g.b)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> InterlockPolicy {
        InterlockPolicy::new(
            [("cyl_up", "cyl_down"), ("tool_down", "tool_up")],
            |_| true,
        )
        .unwrap()
    }

    #[test]
    fn partners_are_symmetric() {
        let p = policy();
        assert_eq!(p.partners("cyl_up").collect::<Vec<_>>(), vec!["cyl_down"]);
        assert_eq!(p.partners("cyl_down").collect::<Vec<_>>(), vec!["cyl_up"]);
        assert_eq!(p.partners("feeder").count(), 0);
    }

    #[test]
    fn rejects_unknown_member() {
        let res = InterlockPolicy::new([("cyl_up", "ghost")], |name| name == "cyl_up");
        assert!(matches!(res, Err(HardwareError::UnknownChannel(name)) if name == "ghost"));
    }

    #[test]
    fn detects_violation() {
        let p = policy();
        assert!(p.is_satisfied(|name| name == "cyl_up"));
        assert!(!p.is_satisfied(|name| name == "cyl_up" || name == "cyl_down"));
    }
}
