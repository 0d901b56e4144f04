use serde::{Deserialize, Serialize};

// Catalog entries are owned by the event admin screens; this core only reads
// the price and decrements `remaining_tickets`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub title: String,
    pub unit_price: i64,
    pub currency: String,
    pub remaining_tickets: i64,
}

impl Event {
    pub fn has_capacity_for(&self, quantity: u32) -> bool {
        self.remaining_tickets >= i64::from(quantity)
    }
}
