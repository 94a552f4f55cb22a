//! Authority transfer contracts between the AtomicTNode (Atn) and Scada.
//!
//! While a contract is `Active` the Atn is the boss of the command tree.
//! Both parties exchange the contract back and forth, each adding a
//! fresh digit (`my_digit`) and echoing the other side's last one.
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// `Created` contracts must be sent within this many seconds of their start
pub const CREATED_WINDOW_S: i64 = 10;

/// Seconds after a contract ends (or is terminated) during which late
/// heartbeats are still accepted
pub const GRACE_PERIOD_S: i64 = 300;

#[derive(Error, Debug, PartialEq)]
pub enum ContractError {
    #[error("Digit out of range {0}")]
    InvalidDigit(u8),
    #[error("{status:?} cannot be authored by {author:?}")]
    WrongAuthor {
        status: ContractStatus,
        author: ContractParty,
    },
    #[error("Created contract sent {0}s away from its start")]
    CreatedOutsideWindow(i64),
    #[error("Termination without a cause")]
    MissingCause,
    #[error("Unknown contract {0}")]
    UnknownContract(Uuid),
    #[error("Unexpected status {got:?} while contract is {current:?}")]
    UnexpectedStatus {
        current: ContractStatus,
        got: ContractStatus,
    },
    #[error("Contract already in force {0}")]
    AlreadyInForce(Uuid),
    #[error("Echoed digit {got:?}, last sent {expected}")]
    DigitMismatch { expected: u8, got: Option<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractParty {
    Atn,
    Scada,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractStatus {
    Created,
    Received,
    Confirmed,
    Active,
    CompletedSuccess,
    CompletedFailureByAtn,
    CompletedFailureByScada,
    CompletedUnknownOutcome,
    TerminatedByAtn,
    TerminatedByScada,
}

impl ContractStatus {
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            ContractStatus::TerminatedByAtn | ContractStatus::TerminatedByScada
        )
    }

    /// No further transitions after these
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ContractStatus::CompletedSuccess
                | ContractStatus::CompletedFailureByAtn
                | ContractStatus::CompletedFailureByScada
                | ContractStatus::CompletedUnknownOutcome
                | ContractStatus::TerminatedByAtn
                | ContractStatus::TerminatedByScada
        )
    }

    /// The only party allowed to put a contract in this status, if restricted
    pub fn author(&self) -> Option<ContractParty> {
        match self {
            ContractStatus::Created
            | ContractStatus::Confirmed
            | ContractStatus::CompletedSuccess
            | ContractStatus::CompletedFailureByAtn
            | ContractStatus::TerminatedByAtn => Some(ContractParty::Atn),
            ContractStatus::Received
            | ContractStatus::CompletedFailureByScada
            | ContractStatus::TerminatedByScada => Some(ContractParty::Scada),
            ContractStatus::Active | ContractStatus::CompletedUnknownOutcome => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Contract {
    pub contract_id: Uuid,
    /// Alias of the node granting authority
    pub from_node: String,
    /// Alias of the node receiving it
    pub to_node: String,
    pub start_s: i64,
    pub duration_minutes: u32,
    pub status: ContractStatus,
    pub my_digit: u8,
    pub your_last_digit: Option<u8>,
    pub signed_proof: Option<String>,
    pub cause: Option<String>,
    pub terminated_s: Option<i64>,
}

impl Contract {
    pub fn end_s(&self) -> i64 {
        self.start_s + i64::from(self.duration_minutes) * 60
    }

    pub fn grace_period_end_s(&self) -> i64 {
        self.terminated_s.unwrap_or_else(|| self.end_s()) + GRACE_PERIOD_S
    }

    pub fn in_force_at(&self, now_s: i64) -> bool {
        self.terminated_s.is_none() && self.start_s <= now_s && now_s < self.end_s()
    }

    /// Check the invariants that hold for any contract authored by
    /// `author` at time `now_s`
    pub fn validate(&self, author: ContractParty, now_s: i64) -> Result<(), ContractError> {
        if self.my_digit > 9 {
            return Err(ContractError::InvalidDigit(self.my_digit));
        }
        if let Some(digit) = self.your_last_digit.filter(|d| *d > 9) {
            return Err(ContractError::InvalidDigit(digit));
        }
        if let Some(required) = self.status.author() {
            if required != author {
                return Err(ContractError::WrongAuthor {
                    status: self.status,
                    author,
                });
            }
        }
        if self.status == ContractStatus::Created {
            let offset = now_s - self.start_s;
            if offset.abs() > CREATED_WINDOW_S {
                return Err(ContractError::CreatedOutsideWindow(offset));
            }
        }
        if self.status.is_terminated()
            && (self.cause.as_deref().map_or(true, str::is_empty) || self.terminated_s.is_none())
        {
            return Err(ContractError::MissingCause);
        }
        Ok(())
    }

    /// Same contract, answered by the other side with a fresh digit
    pub fn reply(&self, status: ContractStatus, my_digit: u8) -> Contract {
        Contract {
            status,
            my_digit,
            your_last_digit: Some(self.my_digit),
            ..self.clone()
        }
    }

    pub fn terminate(&self, status: ContractStatus, cause: &str, now_s: i64, my_digit: u8) -> Contract {
        Contract {
            status,
            my_digit,
            your_last_digit: Some(self.my_digit),
            cause: Some(cause.to_string()),
            terminated_s: Some(now_s),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created(start_s: i64) -> Contract {
        Contract {
            contract_id: Uuid::new_v4(),
            from_node: "hw1.isone.me.versant.keene.beech".into(),
            to_node: "hw1.isone.me.versant.keene.beech.scada".into(),
            start_s,
            duration_minutes: 60,
            status: ContractStatus::Created,
            my_digit: 4,
            your_last_digit: None,
            signed_proof: None,
            cause: None,
            terminated_s: None,
        }
    }

    #[test]
    fn created_only_by_atn_inside_window() {
        let c = created(1000);
        assert!(c.validate(ContractParty::Atn, 1005).is_ok());
        assert!(c.validate(ContractParty::Atn, 990).is_ok());
        assert_eq!(
            c.validate(ContractParty::Atn, 1011),
            Err(ContractError::CreatedOutsideWindow(11))
        );
        assert!(matches!(
            c.validate(ContractParty::Scada, 1000),
            Err(ContractError::WrongAuthor { .. })
        ));
    }

    #[test]
    fn received_only_by_scada() {
        let c = created(1000).reply(ContractStatus::Received, 7);
        assert_eq!(c.your_last_digit, Some(4));
        assert!(c.validate(ContractParty::Scada, 1000).is_ok());
        assert!(c.validate(ContractParty::Atn, 1000).is_err());
    }

    #[test]
    fn digits_in_range() {
        let mut c = created(1000);
        c.my_digit = 10;
        assert_eq!(
            c.validate(ContractParty::Atn, 1000),
            Err(ContractError::InvalidDigit(10))
        );
    }

    #[test]
    fn termination_needs_cause() {
        let c = created(1000).reply(ContractStatus::Active, 1);
        let mut t = c.terminate(ContractStatus::TerminatedByScada, "link lost", 1200, 2);
        assert!(t.validate(ContractParty::Scada, 1200).is_ok());
        t.cause = None;
        assert_eq!(
            t.validate(ContractParty::Scada, 1200),
            Err(ContractError::MissingCause)
        );
    }

    #[test]
    fn grace_period() {
        let c = created(1000);
        assert_eq!(c.end_s(), 1000 + 3600);
        assert_eq!(c.grace_period_end_s(), 1000 + 3600 + 300);
        let t = c.terminate(ContractStatus::TerminatedByAtn, "price spike", 2000, 3);
        assert_eq!(t.grace_period_end_s(), 2300);
        assert!(!t.in_force_at(2100));
        assert!(c.in_force_at(1000));
        assert!(!c.in_force_at(4600));
    }
}
