use crate::domain::ids::UserId;
use crate::domain::money::Money;
use crate::domain::trip::Trip;
use crate::error::Result;
use std::io::Write;

/// Writes the end-of-run report as two CSV tables.
pub struct ReportWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> ReportWriter<W> {
    pub fn new(sink: W) -> Self {
        let writer = csv::WriterBuilder::new()
            .flexible(true)
            .has_headers(false)
            .from_writer(sink);
        Self { writer }
    }

    pub fn write_balances(&mut self, balances: &[(UserId, Money)]) -> Result<()> {
        self.writer.write_record(["account", "balance"])?;
        for (account, balance) in balances {
            self.writer
                .write_record([account.as_str(), &balance.to_string()])?;
        }
        self.writer.flush()?;
        Ok(())
    }

    /// One row per trip, keyed by the label it was created under.
    pub fn write_trips(&mut self, trips: &[(String, Trip)]) -> Result<()> {
        self.writer.write_record([
            "trip",
            "kind",
            "status",
            "negotiation",
            "payment",
            "agreed_price",
        ])?;
        for (label, trip) in trips {
            let agreed = trip.agreed_price.map(|p| p.to_string()).unwrap_or_default();
            self.writer.write_record([
                label.as_str(),
                trip.kind.as_str(),
                trip.status.as_str(),
                trip.negotiation_status.as_str(),
                trip.payment_state.as_str(),
                &agreed,
            ])?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
