// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::anyhow;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("topology: {0}")]
    Topology(String),

    #[error("set arithmetic: {0}")]
    SetArithmetic(String),

    #[error("failed to launch {command:?} ({reason})")]
    Launch { command: String, reason: String },

    #[error("{addr} did not accept connections within {timeout:.1}s")]
    Probe { addr: String, timeout: f64 },

    #[error("{what} did not finish within {timeout:.1}s")]
    WaitTimeout { what: String, timeout: f64 },

    #[error("{what} exited with {code}")]
    ExitNonZero { what: String, code: i32 },

    #[error("exit code of {0} is unknown")]
    ExitCodeUnknown(String),

    #[error("{0} can't be signaled, the remote end did not close")]
    StopUnsupported(String),

    #[error("cgroup {scope}: {reason}")]
    Cgroup { scope: String, reason: String },

    #[error("remote {host}: {reason}")]
    RemoteTransport { host: String, reason: String },

    #[error("cluster api: {0}")]
    ClusterApi(String),

    #[error("precondition: {0}")]
    Precondition(String),

    /// Attached as context to the error which aborted the run.
    #[error("{0} failed")]
    PhaseFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn launch<C: ToString, R: ToString>(command: C, reason: R) -> Self {
        Self::Launch {
            command: command.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn cgroup<S: ToString, R: ToString>(scope: S, reason: R) -> Self {
        Self::Cgroup {
            scope: scope.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn remote<H: ToString, R: ToString>(host: H, reason: R) -> Self {
        Self::RemoteTransport {
            host: host.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Accumulates errors in insertion order and folds them into one.
#[derive(Debug, Default)]
pub struct ErrorCollection {
    errors: Vec<anyhow::Error>,
}

impl ErrorCollection {
    pub fn new() -> Self {
        Default::default()
    }

    /// Successes are ignored.
    pub fn add<T, E>(&mut self, res: Result<T, E>)
    where
        E: Into<anyhow::Error>,
    {
        if let Err(e) = res {
            self.errors.push(e.into());
        }
    }

    pub fn add_err<E: Into<anyhow::Error>>(&mut self, err: Option<E>) {
        if let Some(e) = err {
            self.errors.push(e.into());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[anyhow::Error] {
        &self.errors
    }

    /// `None` when empty. A single error is passed through as is, more are
    /// joined one per line.
    pub fn first_or_nil(mut self) -> Option<anyhow::Error> {
        match self.errors.len() {
            0 => None,
            1 => self.errors.pop(),
            _ => {
                let msgs: Vec<String> = self.errors.iter().map(|e| format!("{:#}", e)).collect();
                Some(anyhow!("{}", msgs.join("\n")))
            }
        }
    }

    pub fn into_result(self) -> anyhow::Result<()> {
        match self.first_or_nil() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorCollection};
    use anyhow::anyhow;

    #[test]
    fn test_error_collection() {
        let mut errs = ErrorCollection::new();
        errs.add::<(), anyhow::Error>(Ok(()));
        errs.add_err::<anyhow::Error>(None);
        assert!(errs.is_empty());
        assert!(ErrorCollection::new().into_result().is_ok());

        errs.add::<(), _>(Err(anyhow!("body failed")));
        errs.add::<(), _>(Err(Error::ExitNonZero {
            what: "mutilate".into(),
            code: 2,
        }));
        errs.add_err(Some(Error::StopUnsupported("agent".into())));
        assert_eq!(errs.len(), 3);

        let msg = format!("{}", errs.first_or_nil().unwrap());
        let lines: Vec<&str> = msg.lines().collect();
        assert_eq!(
            lines,
            vec![
                "body failed",
                "mutilate exited with 2",
                "agent can't be signaled, the remote end did not close",
            ]
        );
    }

    #[test]
    fn test_single_error_keeps_type() {
        let mut errs = ErrorCollection::new();
        errs.add::<(), _>(Err(Error::Precondition("governor".into())));
        let err = errs.into_result().unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::Precondition(what)) => assert_eq!(what, "governor"),
            v => panic!("unexpected {:?}", v),
        }
    }
}
