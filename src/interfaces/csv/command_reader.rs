use crate::error::{Result, TripError};
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    CreateRide,
    CreateHire,
    Assign,
    Propose,
    Approve,
    Reject,
    Inbound,
    Arrived,
    Board,
    ConfirmBoarding,
    Start,
    PaymentDue,
    PayChoice,
    Handover,
    Return,
    ReturnReceived,
    Cancel,
    Pay,
    GatewaySettle,
    Poll,
    Callback,
    Payout,
}

/// One row of a replay file: `command,trip,actor,amount,detail`.
///
/// `trip` is a label chosen by the file author; the replay maps it to the
/// generated trip id.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Command {
    pub command: CommandKind,
    #[serde(default)]
    pub trip: String,
    #[serde(default)]
    pub actor: String,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub detail: Option<String>,
}

impl Command {
    pub fn amount(&self) -> Result<i64> {
        self.amount.ok_or_else(|| {
            TripError::Validation(format!("{:?} needs an amount", self.command))
        })
    }

    pub fn detail(&self) -> Result<&str> {
        self.detail
            .as_deref()
            .filter(|d| !d.is_empty())
            .ok_or_else(|| TripError::Validation(format!("{:?} needs a detail", self.command)))
    }
}

/// Reads replay commands from a CSV source.
///
/// Whitespace is trimmed and short rows are accepted; missing trailing
/// columns read as empty.
pub struct CommandReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> CommandReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily deserializes commands, one `Result` per row.
    pub fn commands(self) -> impl Iterator<Item = Result<Command>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(TripError::from))
    }
}
