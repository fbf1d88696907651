//! Realtime fanout of listing and business mutations.
//!
//! Every write to a listing or business publishes a [`MutationEvent`] on a
//! bounded broadcast channel. Publishing never blocks and never fails the write
//! that triggered it. A subscriber that falls more than the channel capacity
//! behind receives [`FanoutMessage::Lagged`] and must re-fetch through discovery;
//! the fanout only accelerates freshness, storage stays the system of record.

use crate::entities::{ListingStatus, business, listing};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, trace};

/// What happened to a listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingChange {
    /// Newly created
    Inserted,
    /// Units were reserved
    Reserved,
    /// Units were returned by a cancellation
    Released,
    /// The business added units
    Restocked,
    /// Coordinates followed a business move
    Relocated,
    /// Removed from sale
    Archived,
}

/// What happened to a business
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessChange {
    /// Newly created
    Inserted,
    /// Sales counters changed
    SalesUpdated,
    /// A rating was recorded
    RatingUpdated,
    /// Location changed
    Relocated,
}

/// New state of a listing after a write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingEvent {
    /// Kind of write
    pub change: ListingChange,
    /// Row as committed
    pub listing: listing::Model,
    /// Name of the owning business, for rendering and text filters
    pub business_name: String,
    /// Rating of the owning business, for rating filters
    pub business_rating: f64,
    /// Status before the write when the write changed it
    pub previous_status: Option<ListingStatus>,
    /// When the event was published
    pub emitted_at: DateTime<Utc>,
}

/// New state of a business after a write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessEvent {
    /// Kind of write
    pub change: BusinessChange,
    /// Row as committed
    pub business: business::Model,
    /// When the event was published
    pub emitted_at: DateTime<Utc>,
}

/// A committed mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MutationEvent {
    /// Listing row changed
    Listing(ListingEvent),
    /// Business row changed
    Business(BusinessEvent),
}

impl MutationEvent {
    /// Builds a listing event stamped with the current time.
    #[must_use]
    pub fn listing(
        change: ListingChange,
        listing: listing::Model,
        business: &business::Model,
        previous_status: Option<ListingStatus>,
    ) -> Self {
        Self::Listing(ListingEvent {
            change,
            listing,
            business_name: business.name.clone(),
            business_rating: business.average_rating,
            previous_status,
            emitted_at: Utc::now(),
        })
    }

    /// Builds a business event stamped with the current time.
    #[must_use]
    pub fn business(change: BusinessChange, business: business::Model) -> Self {
        Self::Business(BusinessEvent {
            change,
            business,
            emitted_at: Utc::now(),
        })
    }

    /// Business the changed row belongs to
    #[must_use]
    pub const fn business_id(&self) -> i64 {
        match self {
            Self::Listing(event) => event.listing.business_id,
            Self::Business(event) => event.business.id,
        }
    }

    /// Per-row version of the changed row
    #[must_use]
    pub const fn version(&self) -> i64 {
        match self {
            Self::Listing(event) => event.listing.version,
            Self::Business(event) => event.business.version,
        }
    }
}

/// What a subscriber wants to hear about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    /// Every listing and business mutation
    AllListings,
    /// Mutations of one business and its listings
    Business(i64),
}

impl Topic {
    /// Whether `event` belongs to this topic
    #[must_use]
    pub const fn matches(&self, event: &MutationEvent) -> bool {
        match self {
            Self::AllListings => true,
            Self::Business(id) => event.business_id() == *id,
        }
    }
}

/// Item delivered to a subscriber
#[derive(Debug, Clone)]
pub enum FanoutMessage {
    /// A mutation on the subscribed topic
    Event(Arc<MutationEvent>),
    /// The subscriber fell behind and missed this many events; it must re-fetch
    Lagged(u64),
    /// The fanout was dropped
    Closed,
}

/// Broadcast hub shared by every writer and connection.
#[derive(Debug, Clone)]
pub struct Fanout {
    sender: broadcast::Sender<Arc<MutationEvent>>,
}

impl Fanout {
    /// Creates a fanout buffering `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event to every current subscriber and returns how many
    /// received it. Having no subscribers is not an error.
    pub fn publish(&self, event: MutationEvent) -> usize {
        let business_id = event.business_id();
        let version = event.version();
        if let Ok(receivers) = self.sender.send(Arc::new(event)) {
            trace!(
                "Published mutation for business {} (version {}) to {} subscribers",
                business_id, version, receivers
            );
            receivers
        } else {
            debug!(
                "No subscribers for mutation of business {} (version {})",
                business_id, version
            );
            0
        }
    }

    /// Starts receiving events for `topic`. Only events published after this
    /// call are delivered.
    #[must_use]
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        Subscription {
            topic,
            receiver: self.sender.subscribe(),
        }
    }

    /// Number of live subscriptions
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A single subscriber's view of the fanout.
#[derive(Debug)]
pub struct Subscription {
    topic: Topic,
    receiver: broadcast::Receiver<Arc<MutationEvent>>,
}

impl Subscription {
    /// Subscribed topic
    #[must_use]
    pub const fn topic(&self) -> Topic {
        self.topic
    }

    /// Waits for the next event on the topic, a lag notice, or closure.
    pub async fn recv(&mut self) -> FanoutMessage {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.topic.matches(&event) => return FanoutMessage::Event(event),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => return FanoutMessage::Lagged(missed),
                Err(RecvError::Closed) => return FanoutMessage::Closed,
            }
        }
    }
}
