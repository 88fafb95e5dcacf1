use std::path::{Path, PathBuf};

use parcel_protocol::Mode;

use crate::ClientError;

/// A `host:path` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSpec {
    pub host: String,
    pub path: String,
}

impl RemoteSpec {
    /// Splits `arg` at its first `:`. Returns `None` for local paths.
    pub fn parse(arg: &str) -> Option<Self> {
        let (host, path) = arg.split_once(':')?;
        Some(Self {
            host: host.to_string(),
            path: path.to_string(),
        })
    }
}

/// Which way the bytes go, and between which paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferPlan {
    Download { remote: RemoteSpec, local: PathBuf },
    Upload { local: PathBuf, remote: RemoteSpec },
}

impl TransferPlan {
    /// Builds a plan from `<source> <destination>`. Exactly one side must
    /// be remote.
    pub fn from_args(source: &str, destination: &str) -> Result<Self, ClientError> {
        let plan = match (RemoteSpec::parse(source), RemoteSpec::parse(destination)) {
            (Some(remote), None) => TransferPlan::Download {
                remote,
                local: PathBuf::from(destination),
            },
            (None, Some(remote)) => TransferPlan::Upload {
                local: PathBuf::from(source),
                remote,
            },
            (Some(_), Some(_)) => {
                return Err(ClientError::InvalidArguments(
                    "source and destination are both remote".into(),
                ));
            }
            (None, None) => {
                return Err(ClientError::InvalidArguments(
                    "one of source or destination must be host:path".into(),
                ));
            }
        };

        let remote = plan.remote();
        if remote.host.is_empty() {
            return Err(ClientError::InvalidArguments("remote host is empty".into()));
        }
        if remote.path.is_empty() {
            return Err(ClientError::InvalidArguments("remote path is empty".into()));
        }
        if plan.local().as_os_str().is_empty() {
            return Err(ClientError::InvalidArguments("local path is empty".into()));
        }
        Ok(plan)
    }

    /// Handshake mode from the server's point of view.
    pub fn mode(&self) -> Mode {
        match self {
            TransferPlan::Download { .. } => Mode::Recv,
            TransferPlan::Upload { .. } => Mode::Send,
        }
    }

    pub fn remote(&self) -> &RemoteSpec {
        match self {
            TransferPlan::Download { remote, .. } | TransferPlan::Upload { remote, .. } => remote,
        }
    }

    pub fn local(&self) -> &Path {
        match self {
            TransferPlan::Download { local, .. } | TransferPlan::Upload { local, .. } => local,
        }
    }
}
