pub mod feed;
pub mod media;
pub mod subscription;

pub use feed::{Caller, Destination, DestinationClass, FeedId, UserId};
pub use media::{
    HashKind, HashOutcome, MediaContent, MediaHash, MediaRef, Mediated, Signature,
};
pub use subscription::{Draft, Header, Subscription, SubscriptionAction, SubscriptionView};
