//! Per-slug single-flight guard.
//!
//! At most one computation per slug is in flight. Later callers either join the
//! flight and receive its outcome, or are told it is already running.

use crate::models::MetricRefreshOutcome;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

type FlightResult = Option<MetricRefreshOutcome>;
type FlightMap = HashMap<String, watch::Sender<FlightResult>>;

#[derive(Clone, Default)]
pub struct StampedeGuard {
    in_flight: Arc<Mutex<FlightMap>>,
}

pub enum Acquire {
    Acquired(GuardToken),
    InFlight(FlightWaiter),
}

/// Ownership of a slug's flight. Dropping it without [`GuardToken::release`]
/// wakes waiters with no outcome.
pub struct GuardToken {
    slug: String,
    in_flight: Arc<Mutex<FlightMap>>,
    sender: Option<watch::Sender<FlightResult>>,
}

pub struct FlightWaiter {
    receiver: watch::Receiver<FlightResult>,
}

impl StampedeGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn flights(&self) -> std::sync::MutexGuard<'_, FlightMap> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Takes the slug if idle, otherwise returns `None`.
    pub fn try_acquire(&self, slug: &str) -> Option<GuardToken> {
        match self.acquire_or_join(slug) {
            Acquire::Acquired(token) => Some(token),
            Acquire::InFlight(_) => None,
        }
    }

    /// Takes the slug if idle, otherwise subscribes to the running flight.
    pub fn acquire_or_join(&self, slug: &str) -> Acquire {
        let mut flights = self.flights();
        if let Some(sender) = flights.get(slug) {
            return Acquire::InFlight(FlightWaiter {
                receiver: sender.subscribe(),
            });
        }
        let (sender, _) = watch::channel(None);
        flights.insert(slug.to_string(), sender.clone());
        Acquire::Acquired(GuardToken {
            slug: slug.to_string(),
            in_flight: Arc::clone(&self.in_flight),
            sender: Some(sender),
        })
    }

    pub fn is_in_flight(&self, slug: &str) -> bool {
        self.flights().contains_key(slug)
    }

    pub fn in_flight_count(&self) -> usize {
        self.flights().len()
    }
}

impl GuardToken {
    pub fn slug(&self) -> &str {
        &self.slug
    }

    /// Ends the flight and hands `outcome` to every joined caller.
    pub fn release(mut self, outcome: &MetricRefreshOutcome) {
        self.finish(Some(outcome.clone()));
    }

    fn finish(&mut self, outcome: FlightResult) {
        let Some(sender) = self.sender.take() else {
            return;
        };
        {
            let mut flights = self
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            flights.remove(&self.slug);
        }
        sender.send_replace(outcome);
    }
}

impl Drop for GuardToken {
    fn drop(&mut self) {
        self.finish(None);
    }
}

impl FlightWaiter {
    /// Waits for the flight to end. `None` means the owner gave up without an outcome.
    pub async fn wait(mut self) -> Option<MetricRefreshOutcome> {
        match self.receiver.wait_for(|result| result.is_some()).await {
            Ok(result) => (*result).clone(),
            Err(_) => None,
        }
    }
}
