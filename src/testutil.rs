//! Shared test fixtures. Compiled only for unit tests.

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::metrics::OrderRecord;

/// Fixed origin so fixtures are reproducible.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
}

/// Start a healthy, on-time order placed `minute` minutes after [`base_time`].
pub fn order(id: &str, minute: i64) -> OrderBuilder {
    let placed = base_time() + Duration::minutes(minute);
    let promised = placed + Duration::minutes(30);
    OrderBuilder {
        rec: OrderRecord {
            order_id: id.to_string(),
            placed_at: placed,
            store_id: "store_1".to_string(),
            category: "grocery".to_string(),
            region: "SF".to_string(),
            time_of_day: "lunch".to_string(),
            basket_size: "medium".to_string(),
            basket_value: 40.0,
            distance_miles: 2.5,
            merchant_prep_secs: 600.0,
            courier_wait_secs: 300.0,
            batched: false,
            canceled: false,
            promised_at: promised,
            delivered_at: Some(promised),
            items: 5,
            substituted_items: 0,
            missing_items: 0,
            refund_amount: 0.0,
            support_tickets: 0,
            rating: None,
        },
    }
}

pub struct OrderBuilder {
    rec: OrderRecord,
}

impl OrderBuilder {
    pub fn store(mut self, v: &str) -> Self {
        self.rec.store_id = v.to_string();
        self
    }

    pub fn category(mut self, v: &str) -> Self {
        self.rec.category = v.to_string();
        self
    }

    pub fn region(mut self, v: &str) -> Self {
        self.rec.region = v.to_string();
        self
    }

    pub fn time_of_day(mut self, v: &str) -> Self {
        self.rec.time_of_day = v.to_string();
        self
    }

    pub fn basket_size(mut self, v: &str) -> Self {
        self.rec.basket_size = v.to_string();
        self
    }

    pub fn basket_value(mut self, v: f64) -> Self {
        self.rec.basket_value = v;
        self
    }

    pub fn distance(mut self, miles: f64) -> Self {
        self.rec.distance_miles = miles;
        self
    }

    pub fn prep_secs(mut self, v: f64) -> Self {
        self.rec.merchant_prep_secs = v;
        self
    }

    pub fn courier_wait(mut self, secs: f64) -> Self {
        self.rec.courier_wait_secs = secs;
        self
    }

    pub fn batched(mut self) -> Self {
        self.rec.batched = true;
        self
    }

    pub fn canceled(mut self) -> Self {
        self.rec.canceled = true;
        self.rec.delivered_at = None;
        self
    }

    pub fn on_time(mut self) -> Self {
        self.rec.delivered_at = Some(self.rec.promised_at);
        self
    }

    pub fn late_by(mut self, minutes: f64) -> Self {
        self.rec.delivered_at =
            Some(self.rec.promised_at + Duration::seconds((minutes * 60.0) as i64));
        self
    }

    pub fn items(mut self, n: u32) -> Self {
        self.rec.items = n;
        self
    }

    pub fn substituted(mut self, n: u32) -> Self {
        self.rec.substituted_items = n;
        self
    }

    pub fn missing(mut self, n: u32) -> Self {
        self.rec.missing_items = n;
        self
    }

    pub fn refund(mut self, amount: f64) -> Self {
        self.rec.refund_amount = amount;
        self
    }

    pub fn support(mut self, tickets: u32) -> Self {
        self.rec.support_tickets = tickets;
        self
    }

    pub fn rating(mut self, stars: u8) -> Self {
        self.rec.rating = Some(stars);
        self
    }

    pub fn build(self) -> OrderRecord {
        self.rec
    }
}
