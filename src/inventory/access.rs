//! User denylist for inventory queries.

use crate::error::{Error, Result};
use nix::unistd::{getuid, User};
use tracing::warn;

/// Name of the invoking user: `$USER`, falling back to the passwd entry.
pub fn current_user() -> Option<String> {
    std::env::var("USER")
        .ok()
        .filter(|u| !u.is_empty())
        .or_else(|| User::from_uid(getuid()).ok().flatten().map(|u| u.name))
}

/// Reject the current user if it is on `deny_users`.
pub fn check_access(deny_users: &[String]) -> Result<()> {
    check_user(current_user().as_deref(), deny_users)
}

pub fn check_user(user: Option<&str>, deny_users: &[String]) -> Result<()> {
    match user {
        Some(name) if deny_users.iter().any(|d| d == name) => {
            warn!(user = %name, "Inventory access denied");
            Err(Error::AccessDenied {
                user: name.to_string(),
            })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_denied_user() {
        let deny = vec!["guest".to_string(), "nobody".to_string()];
        assert!(matches!(
            check_user(Some("guest"), &deny),
            Err(Error::AccessDenied { .. })
        ));
        assert!(check_user(Some("ops"), &deny).is_ok());
        assert!(check_user(None, &deny).is_ok());
        assert!(check_user(Some("guest"), &[]).is_ok());
    }

    #[test]
    #[serial]
    fn test_current_user_reads_env() {
        let saved = std::env::var("USER").ok();
        std::env::set_var("USER", "runway-test");
        assert_eq!(current_user().as_deref(), Some("runway-test"));
        assert!(check_access(&["runway-test".to_string()]).is_err());
        match saved {
            Some(v) => std::env::set_var("USER", v),
            None => std::env::remove_var("USER"),
        }
    }
}
