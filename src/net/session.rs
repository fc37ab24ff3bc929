//! Session authentication interface (spec §1, §4.7): the real login/account
//! manager is an external collaborator out of scope here. `SessionAuthority`
//! is the narrow seam the TCP client loop calls through.

/// A TCP client command that never requires `ok_session` to pass.
pub const FREE_CMDS: &[&str] = &["SERVER_VERSION", "SERVER_TIME", "LOGIN"];

pub fn is_free_cmd(cmd: &str) -> bool {
    FREE_CMDS.contains(&cmd)
}

pub trait SessionAuthority: Send + Sync {
    fn ok_session(&self, session: i64) -> bool;
}

/// Stand-in for the real account/session manager (out of scope per spec
/// §1): any non-zero session id is accepted.
pub struct PermissiveSessionAuthority;

impl SessionAuthority for PermissiveSessionAuthority {
    fn ok_session(&self, session: i64) -> bool {
        session != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_cmds_contains_version_and_time() {
        assert!(is_free_cmd("SERVER_VERSION"));
        assert!(is_free_cmd("SERVER_TIME"));
        assert!(!is_free_cmd("TRANX_REAL_TIME_GROUP"));
    }

    #[test]
    fn permissive_authority_rejects_only_zero() {
        let auth = PermissiveSessionAuthority;
        assert!(!auth.ok_session(0));
        assert!(auth.ok_session(42));
    }
}
