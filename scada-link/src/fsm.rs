use scada_types::LinkState;

use crate::LinkError;

/// What can happen to a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkInput {
    Start,
    MqttConnected,
    MqttConnectFailed,
    /// A subscription was acked; `pending` subscriptions remain
    SubAck { pending: usize },
    MessageFromPeer,
    ResponseTimeout,
    MqttDisconnected,
    Stop,
}

/// Next state of a link, or `InvalidInput` for a pair the lifecycle
/// does not allow. Benign repeats leave the state as it is.
pub fn transition(state: LinkState, input: LinkInput) -> Result<LinkState, LinkError> {
    use LinkInput::*;
    use LinkState::*;

    let next = match (state, input) {
        (_, Stop) => Stopped,
        (Stopped, _) => return Err(LinkError::InvalidInput { state, input }),
        (NotStarted, Start) => Connecting,
        (Connecting, MqttConnected) => AwaitingSetupAndPeer,
        (Connecting, MqttConnectFailed) => Connecting,
        (_, MqttDisconnected) => Connecting,

        (AwaitingSetupAndPeer, SubAck { pending: 0 }) => AwaitingPeer,
        (AwaitingSetupAndPeer, SubAck { .. }) => AwaitingSetupAndPeer,
        (AwaitingSetupAndPeer, MessageFromPeer) => AwaitingSetup,

        (AwaitingSetup, SubAck { pending: 0 }) => Active,
        (AwaitingSetup, SubAck { .. }) => AwaitingSetup,
        (AwaitingSetup, MessageFromPeer) => AwaitingSetup,
        (AwaitingSetup, ResponseTimeout) => AwaitingSetupAndPeer,

        (AwaitingPeer, MessageFromPeer) => Active,

        (Active, MessageFromPeer) => Active,
        (Active, ResponseTimeout) => AwaitingPeer,

        _ => return Err(LinkError::InvalidInput { state, input }),
    };
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use LinkInput::*;
    use LinkState::*;

    const INPUTS: [LinkInput; 9] = [
        Start,
        MqttConnected,
        MqttConnectFailed,
        SubAck { pending: 1 },
        SubAck { pending: 0 },
        MessageFromPeer,
        ResponseTimeout,
        MqttDisconnected,
        Stop,
    ];

    fn table() -> Vec<(LinkState, LinkInput, LinkState)> {
        let mut rows = vec![
            (NotStarted, Start, Connecting),
            (Connecting, MqttConnected, AwaitingSetupAndPeer),
            (Connecting, MqttConnectFailed, Connecting),
            (AwaitingSetupAndPeer, SubAck { pending: 1 }, AwaitingSetupAndPeer),
            (AwaitingSetupAndPeer, SubAck { pending: 0 }, AwaitingPeer),
            (AwaitingSetupAndPeer, MessageFromPeer, AwaitingSetup),
            (AwaitingSetup, SubAck { pending: 0 }, Active),
            (AwaitingSetup, ResponseTimeout, AwaitingSetupAndPeer),
            (AwaitingPeer, MessageFromPeer, Active),
            (Active, ResponseTimeout, AwaitingPeer),
            // repeats
            (AwaitingSetup, SubAck { pending: 1 }, AwaitingSetup),
            (AwaitingSetup, MessageFromPeer, AwaitingSetup),
            (Active, MessageFromPeer, Active),
        ];
        for state in LinkState::ALL {
            if state != Stopped {
                rows.push((state, MqttDisconnected, Connecting));
            }
            rows.push((state, Stop, Stopped));
        }
        rows
    }

    #[test]
    fn every_listed_row_holds() {
        for (state, input, next) in table() {
            assert_eq!(
                transition(state, input).unwrap(),
                next,
                "{state} + {input:?}"
            );
        }
    }

    #[test]
    fn every_other_pair_is_rejected() {
        let rows = table();
        for state in LinkState::ALL {
            for input in INPUTS {
                if rows.iter().any(|(s, i, _)| *s == state && *i == input) {
                    continue;
                }
                assert!(
                    matches!(
                        transition(state, input),
                        Err(LinkError::InvalidInput { .. })
                    ),
                    "{state} + {input:?} should be rejected"
                );
            }
        }
    }
}
