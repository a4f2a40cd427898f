use crate::core::{DbError, Result, ResultCode};
use crate::protocol::message::MESSAGE_HEADER_SIZE;
use crate::protocol::{Frame, MessageHeader};

/// What the executor does after a handler saw a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerAction {
    /// The response is complete; return the connection to its pool.
    Complete,
    /// More frames follow on the same connection.
    ReadMore,
    /// The caller stopped the stream. Reported as success.
    Abort,
}

/// Continuation that interprets the frames of one command's response.
///
/// Frames reach the handler already inflated. Returning a
/// `TransientServer` error makes the executor retry (while nothing has been
/// delivered yet); any other error ends the command.
pub trait ResponseHandler: Send {
    fn on_frame(&mut self, frame: &Frame) -> Result<HandlerAction>;
}

/// Bookkeeping of a finished command, independent of the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub node: Option<String>,
    pub iterations: u32,
    pub aborted: bool,
}

/// Single-frame response as delivered to the caller.
#[derive(Debug, Clone)]
pub struct Response {
    pub header: MessageHeader,
    /// Whole message body, header included.
    pub body: Vec<u8>,
    pub node: Option<String>,
    pub iterations: u32,
}

impl Response {
    pub fn result_code(&self) -> ResultCode {
        self.header.result_code
    }

    /// Bytes after the message header.
    pub fn payload(&self) -> &[u8] {
        &self.body[MESSAGE_HEADER_SIZE.min(self.body.len())..]
    }
}

/// Maps the server result code onto the executor's failure classes.
fn check_result_code(header: &MessageHeader) -> Result<()> {
    let code = header.result_code;
    if code.is_transient() {
        return Err(DbError::TransientServer {
            code,
            message: code.name().to_string(),
        });
    }
    if code.is_fatal() {
        return Err(DbError::Server {
            code,
            message: code.name().to_string(),
        });
    }
    Ok(())
}

/// Handler for commands answered by exactly one message.
#[derive(Debug, Default)]
pub struct SingleResponse {
    received: Option<(MessageHeader, Vec<u8>)>,
}

impl SingleResponse {
    pub fn into_response(self, outcome: CommandOutcome) -> Result<Response> {
        let (header, body) = self.received.ok_or_else(|| {
            DbError::Protocol("command completed without a response".to_string())
        })?;
        Ok(Response {
            header,
            body,
            node: outcome.node,
            iterations: outcome.iterations,
        })
    }
}

impl ResponseHandler for SingleResponse {
    fn on_frame(&mut self, frame: &Frame) -> Result<HandlerAction> {
        let header = MessageHeader::parse(&frame.body)?;
        check_result_code(&header)?;
        self.received = Some((header, frame.body.clone()));
        Ok(HandlerAction::Complete)
    }
}

/// Handler for multi-message streams ended by the `INFO3_LAST` flag.
///
/// The callback sees each message's header and payload and returns `false`
/// to stop the stream early.
pub struct RecordStream<F> {
    on_record: F,
    messages: usize,
}

impl<F> RecordStream<F>
where
    F: FnMut(&MessageHeader, &[u8]) -> bool + Send,
{
    pub fn new(on_record: F) -> Self {
        Self {
            on_record,
            messages: 0,
        }
    }

    pub fn messages(&self) -> usize {
        self.messages
    }
}

impl<F> ResponseHandler for RecordStream<F>
where
    F: FnMut(&MessageHeader, &[u8]) -> bool + Send,
{
    fn on_frame(&mut self, frame: &Frame) -> Result<HandlerAction> {
        let header = MessageHeader::parse(&frame.body)?;
        check_result_code(&header)?;
        self.messages += 1;
        if !(self.on_record)(&header, &frame.body[MESSAGE_HEADER_SIZE..]) {
            return Ok(HandlerAction::Abort);
        }
        Ok(if header.is_last() {
            HandlerAction::Complete
        } else {
            HandlerAction::ReadMore
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;
    use crate::protocol::message::INFO3_LAST;

    fn message(code: ResultCode, info3: u8, payload: &[u8]) -> Frame {
        let header = MessageHeader {
            result_code: code,
            info3,
            ..MessageHeader::default()
        };
        let mut body = header.encode().to_vec();
        body.extend_from_slice(payload);
        Frame::new(MessageType::Message, body).unwrap()
    }

    #[test]
    fn test_single_response_keeps_payload() {
        let mut handler = SingleResponse::default();
        let action = handler
            .on_frame(&message(ResultCode::RECORD_NOT_FOUND, 0, b"abc"))
            .unwrap();
        assert_eq!(action, HandlerAction::Complete);

        let response = handler
            .into_response(CommandOutcome {
                node: Some("A1".into()),
                iterations: 2,
                aborted: false,
            })
            .unwrap();
        assert_eq!(response.result_code(), ResultCode::RECORD_NOT_FOUND);
        assert_eq!(response.payload(), b"abc");
        assert_eq!(response.iterations, 2);
    }

    #[test]
    fn test_overload_is_transient_and_auth_is_fatal() {
        let mut handler = SingleResponse::default();
        let err = handler
            .on_frame(&message(ResultCode::DEVICE_OVERLOAD, 0, b""))
            .unwrap_err();
        assert!(err.is_retryable());

        let err = handler
            .on_frame(&message(ResultCode::NOT_AUTHENTICATED, 0, b""))
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(err.result_code(), Some(ResultCode::NOT_AUTHENTICATED));
    }

    #[test]
    fn test_stream_reads_until_last_or_abort() {
        let mut seen = Vec::new();
        let mut stream = RecordStream::new(|_: &MessageHeader, payload: &[u8]| {
            seen.push(payload.to_vec());
            payload != b"stop"
        });
        assert_eq!(
            stream.on_frame(&message(ResultCode::OK, 0, b"r1")).unwrap(),
            HandlerAction::ReadMore
        );
        assert_eq!(
            stream
                .on_frame(&message(ResultCode::OK, INFO3_LAST, b"r2"))
                .unwrap(),
            HandlerAction::Complete
        );
        assert_eq!(
            stream.on_frame(&message(ResultCode::OK, 0, b"stop")).unwrap(),
            HandlerAction::Abort
        );
        assert_eq!(stream.messages(), 3);
        drop(stream);
        assert_eq!(seen.len(), 3);
    }
}
