//! The closed set of message kinds the client knows how to route.
//!
//! Everything that needs to know "what kind of message is this" goes through
//! [`MessageType`]; header strings are parsed here and nowhere else.

use std::fmt;

use crate::message::KernelMessage;

macro_rules! message_types {
    ($($variant:ident => $name:literal,)+) => {
        /// A Jupyter `msg_type`.
        ///
        /// Unrecognised types are preserved in [`MessageType::Other`] so they
        /// can still be correlated and forwarded.
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum MessageType {
            $($variant,)+
            Other(String),
        }

        impl MessageType {
            /// The `msg_type` string used on the wire.
            pub fn as_str(&self) -> &str {
                match self {
                    $(MessageType::$variant => $name,)+
                    MessageType::Other(name) => name.as_str(),
                }
            }
        }

        impl From<&str> for MessageType {
            fn from(name: &str) -> Self {
                match name {
                    $($name => MessageType::$variant,)+
                    other => MessageType::Other(other.to_string()),
                }
            }
        }
    };
}

message_types! {
    KernelInfoRequest => "kernel_info_request",
    KernelInfoReply => "kernel_info_reply",
    ExecuteRequest => "execute_request",
    ExecuteReply => "execute_reply",
    ExecuteInput => "execute_input",
    ExecuteResult => "execute_result",
    Stream => "stream",
    DisplayData => "display_data",
    UpdateDisplayData => "update_display_data",
    Error => "error",
    Status => "status",
    ClearOutput => "clear_output",
    CompleteRequest => "complete_request",
    CompleteReply => "complete_reply",
    InspectRequest => "inspect_request",
    InspectReply => "inspect_reply",
    HistoryRequest => "history_request",
    HistoryReply => "history_reply",
    IsCompleteRequest => "is_complete_request",
    IsCompleteReply => "is_complete_reply",
    CommInfoRequest => "comm_info_request",
    CommInfoReply => "comm_info_reply",
    CommOpen => "comm_open",
    CommMsg => "comm_msg",
    CommClose => "comm_close",
    InputRequest => "input_request",
    InputReply => "input_reply",
    InterruptRequest => "interrupt_request",
    InterruptReply => "interrupt_reply",
    ShutdownRequest => "shutdown_request",
    ShutdownReply => "shutdown_reply",
    DebugRequest => "debug_request",
    DebugReply => "debug_reply",
    DebugEvent => "debug_event",
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MessageType {
    /// Whether this type is one of the iopub output kinds that comm callback
    /// groups treat as generic "output".
    pub fn is_output(&self) -> bool {
        matches!(
            self,
            MessageType::DisplayData
                | MessageType::ExecuteResult
                | MessageType::Stream
                | MessageType::Error
        )
    }
}

pub fn is_stream_msg(msg: &KernelMessage) -> bool {
    msg.msg_type() == MessageType::Stream
}

pub fn is_display_data_msg(msg: &KernelMessage) -> bool {
    msg.msg_type() == MessageType::DisplayData
}

pub fn is_update_display_data_msg(msg: &KernelMessage) -> bool {
    msg.msg_type() == MessageType::UpdateDisplayData
}

pub fn is_execute_input_msg(msg: &KernelMessage) -> bool {
    msg.msg_type() == MessageType::ExecuteInput
}

pub fn is_execute_result_msg(msg: &KernelMessage) -> bool {
    msg.msg_type() == MessageType::ExecuteResult
}

pub fn is_error_msg(msg: &KernelMessage) -> bool {
    msg.msg_type() == MessageType::Error
}

pub fn is_status_msg(msg: &KernelMessage) -> bool {
    msg.msg_type() == MessageType::Status
}

pub fn is_clear_output_msg(msg: &KernelMessage) -> bool {
    msg.msg_type() == MessageType::ClearOutput
}

/// Debug messages are an experimental extension of the messaging protocol.
pub fn is_debug_event_msg(msg: &KernelMessage) -> bool {
    msg.msg_type() == MessageType::DebugEvent
}

pub fn is_comm_open_msg(msg: &KernelMessage) -> bool {
    msg.msg_type() == MessageType::CommOpen
}

pub fn is_comm_close_msg(msg: &KernelMessage) -> bool {
    msg.msg_type() == MessageType::CommClose
}

pub fn is_comm_msg_msg(msg: &KernelMessage) -> bool {
    msg.msg_type() == MessageType::CommMsg
}

pub fn is_info_request_msg(msg: &KernelMessage) -> bool {
    msg.msg_type() == MessageType::KernelInfoRequest
}

pub fn is_execute_reply_msg(msg: &KernelMessage) -> bool {
    msg.msg_type() == MessageType::ExecuteReply
}

pub fn is_debug_request_msg(msg: &KernelMessage) -> bool {
    msg.msg_type() == MessageType::DebugRequest
}

pub fn is_debug_reply_msg(msg: &KernelMessage) -> bool {
    msg.msg_type() == MessageType::DebugReply
}

pub fn is_input_request_msg(msg: &KernelMessage) -> bool {
    msg.msg_type() == MessageType::InputRequest
}

pub fn is_input_reply_msg(msg: &KernelMessage) -> bool {
    msg.msg_type() == MessageType::InputReply
}
