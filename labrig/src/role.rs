//! Roles: the abstract names test code requests machines by.

use std::fmt;

/// A role a machine can fill, e.g. "the lab host" or "the board's U-Boot".
///
/// Roles carry no behavior; they are registry keys. A role may refine a
/// parent role, in which case a machine providing the refined role also
/// satisfies the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Role {
    name: &'static str,
    parent: Option<&'static Role>,
}

impl Role {
    /// A root role.
    pub const fn new(name: &'static str) -> Self {
        Self { name, parent: None }
    }

    /// A role that refines `parent`.
    pub const fn refining(name: &'static str, parent: &'static Role) -> Self {
        Self {
            name,
            parent: Some(parent),
        }
    }

    /// Name of the role.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The role this one refines.
    pub fn parent(&self) -> Option<&'static Role> {
        self.parent
    }

    /// Whether this role is `other` or refines it (transitively).
    pub fn is_a(&self, other: &Role) -> bool {
        let mut current = Some(self);
        while let Some(role) = current {
            if role == other {
                return true;
            }
            current = role.parent;
        }
        false
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// The host the test run executes on.
pub const LAB_HOST: Role = Role::new("lab-host");

/// The host builds run on.
pub const BUILD_HOST: Role = Role::new("build-host");

/// The device under test.
pub const BOARD: Role = Role::new("board");

/// The bootloader shell of the device under test.
pub const BOARD_UBOOT: Role = Role::refining("board-uboot", &BOARD);

/// The Linux shell of the device under test.
pub const BOARD_LINUX: Role = Role::refining("board-linux", &BOARD);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_refinement() {
        assert!(BOARD_LINUX.is_a(&BOARD));
        assert!(BOARD_LINUX.is_a(&BOARD_LINUX));
        assert!(!BOARD.is_a(&BOARD_LINUX));
        assert!(!BOARD_UBOOT.is_a(&BOARD_LINUX));
        assert!(!LAB_HOST.is_a(&BUILD_HOST));
    }

    #[test]
    fn test_roles_are_keys() {
        let roles: HashSet<Role> = [LAB_HOST, BUILD_HOST, LAB_HOST].into_iter().collect();
        assert_eq!(roles.len(), 2);
        assert_eq!(BOARD_UBOOT.to_string(), "board-uboot");
        assert_eq!(BOARD_UBOOT.parent(), Some(&BOARD));
    }
}
