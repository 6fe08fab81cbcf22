//! In-process doubles for the external providers step bodies call

use conduit_core::CoreError;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// A successful card capture
#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    pub payment_id: String,
    pub amount: f64,
    pub capture_id: String,
}

/// Card acquirer double
#[derive(Default)]
pub struct FakeAcquirer {
    captures: Mutex<Vec<Capture>>,
    declined_cards: Mutex<HashSet<String>>,
    outages: Mutex<usize>,
}

impl FakeAcquirer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Captures on `card` are declined from now on
    pub fn decline(&self, card: &str) {
        self.declined_cards.lock().insert(card.to_string());
    }

    /// The next `calls` captures fail as if the acquirer were down
    pub fn fail_next(&self, calls: usize) {
        *self.outages.lock() = calls;
    }

    pub async fn capture(&self, payment_id: &str, card: &str, amount: f64) -> Result<Capture, CoreError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        {
            let mut outages = self.outages.lock();
            if *outages > 0 {
                *outages -= 1;
                return Err(CoreError::TransientExternalError(
                    "acquirer unavailable".to_string(),
                ));
            }
        }
        if self.declined_cards.lock().contains(card) {
            return Err(CoreError::NotAuthorizedError(format!("card {} declined", card)));
        }

        let mut captures = self.captures.lock();
        let capture = Capture {
            payment_id: payment_id.to_string(),
            amount,
            capture_id: format!("cap_{}", captures.len() + 1),
        };
        captures.push(capture.clone());
        Ok(capture)
    }

    pub fn captures(&self) -> Vec<Capture> {
        self.captures.lock().clone()
    }
}

/// An order accepted by an exchange
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub exchange: String,
    pub order_id: String,
}

/// Exchange double tracking how many orders each venue handles at once
#[derive(Default)]
pub struct FakeExchange {
    placements: Mutex<Vec<Placement>>,
    in_flight: Mutex<HashMap<String, usize>>,
    peak_in_flight: Mutex<HashMap<String, usize>>,
}

impl FakeExchange {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn place(&self, exchange: &str, order_id: &str, quantity: f64) -> Result<String, CoreError> {
        {
            let mut in_flight = self.in_flight.lock();
            let current = in_flight.entry(exchange.to_string()).or_insert(0);
            *current += 1;
            let mut peak = self.peak_in_flight.lock();
            let seen = peak.entry(exchange.to_string()).or_insert(0);
            *seen = (*seen).max(*current);
        }

        tokio::time::sleep(Duration::from_millis(15)).await;

        let result = if quantity <= 0.0 {
            Err(CoreError::ValidationError(format!(
                "order {} has non-positive quantity",
                order_id
            )))
        } else {
            self.placements.lock().push(Placement {
                exchange: exchange.to_string(),
                order_id: order_id.to_string(),
            });
            Ok(format!("{}-{}", exchange, order_id))
        };

        if let Some(current) = self.in_flight.lock().get_mut(exchange) {
            *current -= 1;
        }
        result
    }

    pub fn placements(&self) -> Vec<Placement> {
        self.placements.lock().clone()
    }

    /// Order ids placed on `exchange`, in placement order
    pub fn placed_on(&self, exchange: &str) -> Vec<String> {
        self.placements
            .lock()
            .iter()
            .filter(|placement| placement.exchange == exchange)
            .map(|placement| placement.order_id.clone())
            .collect()
    }

    /// Most orders `exchange` ever handled at the same time
    pub fn peak_in_flight(&self, exchange: &str) -> usize {
        self.peak_in_flight.lock().get(exchange).copied().unwrap_or(0)
    }
}

/// A delivered message
#[derive(Debug, Clone, PartialEq)]
pub struct Email {
    pub to: String,
    pub template: String,
}

/// Mailer double
#[derive(Default)]
pub struct FakeMailer {
    sent: Mutex<Vec<Email>>,
    down: Mutex<bool>,
}

impl FakeMailer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_down(&self, down: bool) {
        *self.down.lock() = down;
    }

    pub async fn send(&self, to: &str, template: &str) -> Result<(), CoreError> {
        if *self.down.lock() {
            return Err(CoreError::TransientExternalError(
                "smtp relay unavailable".to_string(),
            ));
        }
        self.sent.lock().push(Email {
            to: to.to_string(),
            template: template.to_string(),
        });
        Ok(())
    }

    pub fn sent(&self) -> Vec<Email> {
        self.sent.lock().clone()
    }

    pub fn sent_template(&self, template: &str) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|email| email.template == template)
            .count()
    }
}
