//! Scroll-driven history pagination.
//!
//! The pure scroll math lives here alongside the [`Paginator`], which owns
//! the one-older-fetch-at-a-time guard, the timeout/retry budget, and the
//! stale-room discard. The viewport itself is out of scope; callers feed in
//! [`ScrollMetrics`] and apply the returned adjustments.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::FetchPolicy;
use crate::error::ClientError;
use crate::rest::PageFetcher;
use crate::store::{MessageStore, PageDirection};
use shared::domain::RoomId;

/// Within this distance of the bottom the user counts as "at the bottom"
/// and incoming pushes may auto-scroll; further up they get an affordance
/// instead of being yanked down mid-read.
pub const BOTTOM_PROXIMITY_PX: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollMetrics {
    pub scroll_top: f64,
    pub scroll_height: f64,
    pub viewport_height: f64,
}

impl ScrollMetrics {
    pub fn distance_from_bottom(&self) -> f64 {
        self.scroll_height - (self.scroll_top + self.viewport_height)
    }

    pub fn is_near_bottom(&self) -> bool {
        self.distance_from_bottom() <= BOTTOM_PROXIMITY_PX
    }

    pub fn is_at_top(&self) -> bool {
        self.scroll_top <= 0.0
    }
}

/// What the view should do with a push-delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushDisposition {
    /// User is at (or near) the bottom: follow the conversation.
    StickToBottom,
    /// User is reading history: surface a "new messages below" affordance.
    NotifyNewMessages,
}

pub fn push_disposition(metrics: ScrollMetrics) -> PushDisposition {
    if metrics.is_near_bottom() {
        PushDisposition::StickToBottom
    } else {
        PushDisposition::NotifyNewMessages
    }
}

/// Whether a scroll event should trigger an older-page fetch. Suppressed
/// while a fetch is in flight, when no older page exists, and while the user
/// holds a text selection (scrolling must not disrupt a copy).
pub fn should_fetch_older(
    metrics: ScrollMetrics,
    in_flight: bool,
    has_older: bool,
    text_selection_active: bool,
) -> bool {
    metrics.is_at_top() && !in_flight && has_older && !text_selection_active
}

/// The anti-jump invariant: after an older page is prepended, advance the
/// scroll offset by exactly the height the new content added so the message
/// the user was reading stays visually stationary.
pub fn anchored_scroll_top(before: ScrollMetrics, new_scroll_height: f64) -> f64 {
    before.scroll_top + (new_scroll_height - before.scroll_height)
}

pub struct Paginator {
    room_id: RoomId,
    fetcher: Arc<dyn PageFetcher>,
    policy: FetchPolicy,
    in_flight: bool,
}

impl Paginator {
    pub fn new(room_id: RoomId, fetcher: Arc<dyn PageFetcher>, policy: FetchPolicy) -> Self {
        Self {
            room_id,
            fetcher,
            policy,
            in_flight: false,
        }
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Fetch the newest page for a freshly opened room.
    pub async fn fetch_initial(&mut self, store: &mut MessageStore) -> Result<usize, ClientError> {
        self.fetch(store, None, PageDirection::Initial).await
    }

    /// Fetch one older page, if one exists and none is already in flight.
    /// Returns the number of messages inserted; `Ok(0)` when the call was
    /// suppressed by the guard or no older history remains.
    pub async fn fetch_older(&mut self, store: &mut MessageStore) -> Result<usize, ClientError> {
        if !store.has_older() {
            return Ok(0);
        }
        let cursor = store.next_cursor().map(str::to_string);
        self.fetch(store, cursor, PageDirection::Older).await
    }

    /// Forward pagination through `previous_cursor`. Reserved: live chat
    /// receives the newest messages via push, so nothing drives this today.
    pub async fn fetch_newer(&mut self, store: &mut MessageStore) -> Result<usize, ClientError> {
        let Some(cursor) = store.previous_cursor().map(str::to_string) else {
            return Ok(0);
        };
        self.fetch(store, Some(cursor), PageDirection::Newer).await
    }

    async fn fetch(
        &mut self,
        store: &mut MessageStore,
        cursor: Option<String>,
        direction: PageDirection,
    ) -> Result<usize, ClientError> {
        if self.in_flight {
            debug!(room_id = self.room_id.0, "page fetch suppressed: already in flight");
            return Ok(0);
        }
        let room_id = self.room_id;
        let fetcher = Arc::clone(&self.fetcher);
        let policy = self.policy;
        self.in_flight = true;
        // The guard must clear even when the caller drops this future
        // mid-await, or every later fetch would be suppressed.
        let guard = InFlightReset {
            flag: &mut self.in_flight,
        };
        let result = fetch_with_policy(fetcher.as_ref(), room_id, policy, cursor.as_deref()).await;
        drop(guard);

        match result {
            Ok(page) => match store.apply_history_page(page, direction) {
                Ok(inserted) => Ok(inserted),
                // A page for a room we already navigated away from is
                // discarded, never surfaced as a failure.
                Err(ClientError::StaleRoom { expected, got }) => {
                    warn!(
                        expected = expected.0,
                        got = got.0,
                        "discarding stale history page"
                    );
                    Ok(0)
                }
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        }
    }
}

/// Clears the paginator's in-flight flag on drop.
struct InFlightReset<'a> {
    flag: &'a mut bool,
}

impl Drop for InFlightReset<'_> {
    fn drop(&mut self) {
        *self.flag = false;
    }
}

async fn fetch_with_policy(
    fetcher: &dyn PageFetcher,
    room_id: RoomId,
    policy: FetchPolicy,
    cursor: Option<&str>,
) -> Result<shared::protocol::MessagePage, ClientError> {
    let attempts = policy.retries + 1;
    for attempt in 1..=attempts {
        match tokio::time::timeout(policy.timeout, fetcher.fetch_page(room_id, cursor)).await {
            Ok(result) => return result,
            Err(_) if attempt < attempts => {
                warn!(
                    room_id = room_id.0,
                    attempt,
                    "history fetch timed out; retrying"
                );
                tokio::time::sleep(policy.retry_delay).await;
            }
            Err(_) => return Err(ClientError::FetchTimeout { attempts }),
        }
    }
    Err(ClientError::FetchTimeout { attempts })
}
