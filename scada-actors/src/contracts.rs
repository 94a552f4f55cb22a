use rand::Rng;
use scada_types::{Contract, ContractError, ContractParty, ContractStatus};

fn digit() -> u8 {
    rand::thread_rng().gen_range(0..=9)
}

/// Scada's side of the authority transfer contract with the Atn. At most
/// one contract is tracked; a finished one is kept until its grace period
/// ends so late heartbeats are still recognised.
#[derive(Debug, Default)]
pub struct ContractManager {
    current: Option<Contract>,
}

impl ContractManager {
    pub fn current(&self) -> Option<&Contract> {
        self.current.as_ref()
    }

    /// The Atn holds authority right now
    pub fn in_force(&self, now_s: i64) -> bool {
        self.current
            .as_ref()
            .is_some_and(|c| c.status == ContractStatus::Active && c.in_force_at(now_s))
    }

    fn expect_current(
        &self,
        contract: &Contract,
        status: ContractStatus,
    ) -> Result<&Contract, ContractError> {
        let current = self
            .current
            .as_ref()
            .filter(|c| c.contract_id == contract.contract_id)
            .ok_or(ContractError::UnknownContract(contract.contract_id))?;
        if current.status != status {
            return Err(ContractError::UnexpectedStatus {
                current: current.status,
                got: contract.status,
            });
        }
        Ok(current)
    }

    /// Handle a contract heartbeat from the Atn, returning the reply to
    /// send back, if any
    pub fn on_heartbeat(
        &mut self,
        contract: Contract,
        now_s: i64,
    ) -> Result<Option<Contract>, ContractError> {
        contract.validate(ContractParty::Atn, now_s)?;

        if let Some(current) = &self.current {
            if current.contract_id == contract.contract_id && current.status.is_final() {
                log::debug!(
                    "Late heartbeat for finished contract {}",
                    contract.contract_id
                );
                return Ok(None);
            }
        }

        match contract.status {
            ContractStatus::Created => {
                if let Some(current) = &self.current {
                    if current.contract_id != contract.contract_id && !current.status.is_final() {
                        return Err(ContractError::AlreadyInForce(current.contract_id));
                    }
                }
                let reply = contract.reply(ContractStatus::Received, digit());
                log::info!("Received contract {}", contract.contract_id);
                self.current = Some(reply.clone());
                Ok(Some(reply))
            }
            ContractStatus::Confirmed => {
                self.expect_current(&contract, ContractStatus::Received)?;
                let reply = contract.reply(ContractStatus::Active, digit());
                log::info!(
                    "Contract {} active for {} minutes",
                    contract.contract_id,
                    contract.duration_minutes
                );
                self.current = Some(reply.clone());
                Ok(Some(reply))
            }
            ContractStatus::Active => {
                let current = self.expect_current(&contract, ContractStatus::Active)?;
                if contract.your_last_digit != Some(current.my_digit) {
                    return Err(ContractError::DigitMismatch {
                        expected: current.my_digit,
                        got: contract.your_last_digit,
                    });
                }
                let reply = contract.reply(ContractStatus::Active, digit());
                self.current = Some(reply.clone());
                Ok(Some(reply))
            }
            status => {
                self.current
                    .as_ref()
                    .filter(|c| c.contract_id == contract.contract_id)
                    .ok_or(ContractError::UnknownContract(contract.contract_id))?;
                log::info!("Contract {} ended: {status:?}", contract.contract_id);
                self.current = Some(contract);
                Ok(None)
            }
        }
    }

    /// End the contract from Scada's side, returning the message for the Atn
    pub fn terminate(&mut self, cause: &str, now_s: i64) -> Option<Contract> {
        let current = self.current.as_ref().filter(|c| !c.status.is_final())?;
        let terminated = current.terminate(ContractStatus::TerminatedByScada, cause, now_s, digit());
        log::warn!(
            "Terminating contract {}: {cause}",
            terminated.contract_id
        );
        self.current = Some(terminated.clone());
        Some(terminated)
    }

    /// Close out an active contract past its end and forget finished ones
    /// past their grace period. Returns whether anything changed.
    pub fn tick(&mut self, now_s: i64) -> bool {
        let Some(current) = &mut self.current else {
            return false;
        };
        if current.status == ContractStatus::Active && now_s >= current.end_s() {
            log::warn!(
                "Contract {} ran out without a completion from the Atn",
                current.contract_id
            );
            current.status = ContractStatus::CompletedUnknownOutcome;
            return true;
        }
        if now_s < current.grace_period_end_s() {
            return false;
        }
        if !current.status.is_final() {
            log::warn!("Contract {} abandoned in {:?}", current.contract_id, current.status);
        }
        self.current = None;
        true
    }
}
