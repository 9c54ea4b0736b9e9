//! # When a dead worker is replaced.
//!
//! Applies only to children that die on their own after the cluster became ready.
//! Children the supervisor is stopping are never replaced, and a failure during
//! cluster start is a startup error, not a respawn.
//!
//! ```text
//! exit code       Never   OnFailure   Always
//! Some(0)         no      no          yes
//! Some(n != 0)    no      yes         yes
//! None (killed)   no      yes         yes
//! ```

/// Respawn decision for a worker that exited unexpectedly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RestartPolicy {
    /// A dead worker stays dead; the pool shrinks.
    Never,
    /// Replace workers that crashed or were killed (default).
    #[default]
    OnFailure,
    /// Replace every worker that exits, even with code 0.
    Always,
}

impl RestartPolicy {
    pub fn should_respawn(&self, code: Option<i32>) -> bool {
        match self {
            RestartPolicy::Never => false,
            RestartPolicy::OnFailure => code != Some(0),
            RestartPolicy::Always => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::Never => "never",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::Always => "always",
        }
    }
}

impl std::str::FromStr for RestartPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never" => Ok(RestartPolicy::Never),
            "on-failure" => Ok(RestartPolicy::OnFailure),
            "always" => Ok(RestartPolicy::Always),
            other => Err(format!("unknown restart policy '{other}' (never, on-failure, always)")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_table() {
        assert!(!RestartPolicy::Never.should_respawn(None));
        assert!(!RestartPolicy::OnFailure.should_respawn(Some(0)));
        assert!(RestartPolicy::OnFailure.should_respawn(Some(1)));
        assert!(RestartPolicy::OnFailure.should_respawn(None));
        assert!(RestartPolicy::Always.should_respawn(Some(0)));
        assert_eq!("on-failure".parse(), Ok(RestartPolicy::OnFailure));
        assert!("sometimes".parse::<RestartPolicy>().is_err());
    }
}
