//! The explicit caller identity passed into every core operation.

use common::{Provider, UserId};
use serde::{Deserialize, Serialize};

/// Who is asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Identity {
    /// An authenticated portal user.
    User(UserId),
    /// A provider webhook that passed authenticity verification.
    Provider(Provider),
    /// An internal caller such as a reconciliation sweep.
    Operator,
}

impl Identity {
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Identity::User(id) => Some(*id),
            _ => None,
        }
    }

    /// Returns true if this identity may read or change records owned by `owner`.
    ///
    /// Providers act on sessions through correlation ids, never by ownership.
    pub fn may_access(&self, owner: UserId) -> bool {
        match self {
            Identity::User(id) => *id == owner,
            Identity::Operator => true,
            Identity::Provider(_) => false,
        }
    }

    /// Returns true if this identity may trigger provisioning for `owner`'s session.
    pub fn may_provision(&self, owner: UserId) -> bool {
        matches!(self, Identity::Provider(_)) || self.may_access(owner)
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Identity::User(id) => write!(f, "user:{id}"),
            Identity::Provider(provider) => write!(f, "provider:{provider}"),
            Identity::Operator => f.write_str("operator"),
        }
    }
}
