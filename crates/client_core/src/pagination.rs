use shared::protocol::HistoryQuery;
use tracing::debug;

use crate::guard::ConversationTicket;

/// Geometry of the scroll container as the renderer reports it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollMetrics {
    pub content_height: f64,
    pub scroll_offset: f64,
}

/// Recorded before an older page is requested. Once the merged page has been rendered,
/// [`ScrollAnchor::restored_offset`] keeps the previously topmost message where it was.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollAnchor {
    pub previous_content_height: f64,
    pub previous_offset: f64,
}

impl ScrollAnchor {
    pub fn capture(metrics: ScrollMetrics) -> Self {
        Self {
            previous_content_height: metrics.content_height,
            previous_offset: metrics.scroll_offset,
        }
    }

    pub fn restored_offset(&self, new_content_height: f64) -> f64 {
        (new_content_height - self.previous_content_height + self.previous_offset).max(0.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub ticket: ConversationTicket,
    pub query: HistoryQuery,
    pub anchor: Option<ScrollAnchor>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BeginLoad {
    Request(PageRequest),
    AlreadyLoading,
    Exhausted,
    Stale,
}

#[derive(Debug)]
struct PaginationState {
    ticket: ConversationTicket,
    /// Messages the server-side offset has moved past so far.
    covered: u32,
    first_load_done: bool,
    exhausted: bool,
    in_flight: bool,
}

pub struct PaginationController {
    first_page_size: u32,
    older_page_size: u32,
    state: Option<PaginationState>,
}

impl PaginationController {
    pub fn new(first_page_size: u32, older_page_size: u32) -> Self {
        Self {
            first_page_size: first_page_size.max(1),
            older_page_size: older_page_size.max(1),
            state: None,
        }
    }

    /// Starts over for the conversation behind `ticket`. Local-only conversations start
    /// exhausted so history fetching stops instead of pausing.
    pub fn reset(&mut self, ticket: ConversationTicket) {
        let exhausted = ticket.peer().is_none();
        self.state = Some(PaginationState {
            ticket,
            covered: 0,
            first_load_done: false,
            exhausted,
            in_flight: false,
        });
    }

    pub fn is_exhausted(&self) -> bool {
        self.state.as_ref().map_or(true, |state| state.exhausted)
    }

    pub fn is_loading(&self) -> bool {
        self.state.as_ref().is_some_and(|state| state.in_flight)
    }

    pub fn begin(&mut self, ticket: &ConversationTicket, scroll: Option<ScrollMetrics>) -> BeginLoad {
        let Some(state) = self.state.as_mut() else {
            return BeginLoad::Stale;
        };
        if state.ticket != *ticket {
            return BeginLoad::Stale;
        }
        if state.exhausted {
            return BeginLoad::Exhausted;
        }
        if state.in_flight {
            return BeginLoad::AlreadyLoading;
        }

        let query = if state.first_load_done {
            let limit = self.older_page_size;
            HistoryQuery {
                page: state.covered / limit + 1,
                limit,
            }
        } else {
            HistoryQuery {
                page: 1,
                limit: self.first_page_size,
            }
        };
        state.in_flight = true;

        // The first page lands at the bottom, so there is nothing to hold still.
        let anchor = if state.first_load_done {
            scroll.map(ScrollAnchor::capture)
        } else {
            None
        };

        BeginLoad::Request(PageRequest {
            ticket: ticket.clone(),
            query,
            anchor,
        })
    }

    /// Records a fetched page. Returns whether history is now exhausted, or `None` if the
    /// request belongs to a conversation that is no longer tracked.
    pub fn complete(&mut self, request: &PageRequest, returned: usize, total_pages: u32) -> Option<bool> {
        let state = self.tracking(request)?;
        state.in_flight = false;
        state.first_load_done = true;
        state.covered = request.query.page.saturating_mul(request.query.limit);
        state.exhausted = returned < request.query.limit as usize || request.query.page >= total_pages;
        debug!(
            page = request.query.page,
            limit = request.query.limit,
            returned,
            total_pages,
            exhausted = state.exhausted,
            "pagination: page recorded"
        );
        Some(state.exhausted)
    }

    /// Releases the in-flight slot after a failed fetch so the next scroll can retry.
    pub fn fail(&mut self, request: &PageRequest) {
        if let Some(state) = self.tracking(request) {
            state.in_flight = false;
        }
    }

    fn tracking(&mut self, request: &PageRequest) -> Option<&mut PaginationState> {
        self.state
            .as_mut()
            .filter(|state| state.ticket == request.ticket)
    }
}

#[cfg(test)]
#[path = "tests/pagination_tests.rs"]
mod tests;
