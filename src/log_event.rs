/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

/// Protocol events that might be interesting to log or aggregate into
/// metrics, fed to `ApplicationLayer::event_log`. Do not base protocol
/// decisions on these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEvent {
    SendHello,
    /// `(retransmission count)`
    ResendHello(u8),
    SendCommit,
    ResendCommit(u8),
    SendDhPart1,
    SendDhPart2,
    ResendDhPart2(u8),
    SendConfirm1,
    SendConfirm2,
    ResendConfirm2(u8),
    RetransmissionCapReached,
    ReceiveValidHello,
    ReceiveValidHelloAck,
    ReceiveValidCommit,
    /// `(we stayed initiator)`
    CommitContention(bool),
    ReceiveValidDhPart1,
    ReceiveValidDhPart2,
    ReceiveValidConfirm1,
    ReceiveValidConfirm2,
    ReceiveConf2Ack,
    /// `(fragment count so far)` for the message currently reassembling.
    ReceiveFragment(usize),
    ChannelSecured,
    #[cfg(feature = "goclear")]
    SendGoClear,
    #[cfg(feature = "goclear")]
    ReceiveGoClear,
}

/// Compile-time switch for event logging; expands to nothing without the
/// `logging` feature.
macro_rules! log {
    ($app:expr, $channel:expr, $event:expr) => {
        #[cfg(feature = "logging")]
        $app.event_log($channel, $event);
    };
}
pub(crate) use log;
