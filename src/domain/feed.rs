use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Chat or channel that receives relayed content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeedId(pub i64);

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FeedId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(FeedId)
    }
}

/// Platform user, used for admin checks and notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<UserId> for FeedId {
    /// Direct messages to a user are addressed by the user id.
    fn from(user: UserId) -> Self {
        FeedId(user.0)
    }
}

/// Kind of destination, which determines its delivery interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationClass {
    Direct,
    Group,
    Channel,
}

/// A destination alias resolved to its canonical id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    pub id: FeedId,
    pub class: DestinationClass,
}

/// Who is asking the state controller to do something.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    /// A platform user; must be a feed admin or a configured supervisor.
    User(UserId),
    /// The local operator (CLI), always allowed.
    Console,
}
