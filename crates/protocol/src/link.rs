//! Worker links: one long-lived TCP connection per worker.

use std::io::{BufReader, BufWriter, Write};
use std::net::TcpStream;

use crate::error::{ProtocolError, Result};
use crate::frame::Frame;
use crate::FrameTag;

/// A framed, blocking connection to one peer. FIFO per connection; the
/// caller enforces the one-reply-per-step discipline.
pub struct WorkerLink {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    peer: String,
}

impl WorkerLink {
    /// Root side: connect to a worker at `host:port`.
    pub fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        tracing::info!(worker = addr, "connected worker link");
        Self::from_stream(stream)
    }

    /// Worker side: wrap an accepted root connection.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
        let reader = BufReader::new(stream.try_clone()?);
        let writer = BufWriter::new(stream);
        Ok(Self { reader, writer, peer })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn send(&mut self, frame: &Frame) -> Result<()> {
        frame.write_to(&mut self.writer)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn recv(&mut self) -> Result<Frame> {
        Frame::read_from(&mut self.reader)
    }

    /// Receive a frame and require a specific tag; an `Error` frame from the
    /// peer surfaces as [`ProtocolError::Remote`].
    pub fn recv_expect(&mut self, expected: FrameTag) -> Result<Frame> {
        let frame = self.recv()?;
        if frame.tag == FrameTag::Error {
            let code = crate::payload::error_code(&frame.payload)?;
            return Err(ProtocolError::Remote(code));
        }
        if frame.tag != expected {
            return Err(ProtocolError::UnexpectedFrame { expected, got: frame.tag });
        }
        Ok(frame)
    }
}

/// The root's ordered set of worker links. Slice `k + 1` is `links[k]`.
pub struct LinkPool {
    links: Vec<WorkerLink>,
}

impl LinkPool {
    /// Connect every worker in order. Connections are held for the process
    /// lifetime.
    pub fn connect(addrs: &[String]) -> Result<Self> {
        let links = addrs.iter().map(|a| WorkerLink::connect(a)).collect::<Result<Vec<_>>>()?;
        Ok(Self { links })
    }

    pub fn empty() -> Self {
        Self { links: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn link(&mut self, idx: usize) -> &mut WorkerLink {
        &mut self.links[idx]
    }

    /// Send the same frame to every worker, in worker order.
    pub fn broadcast(&mut self, frame: &Frame) -> Result<()> {
        for link in &mut self.links {
            link.send(frame)?;
        }
        Ok(())
    }

    /// Best-effort broadcast used on the abort path; send failures are
    /// logged and swallowed because the request is already dead.
    pub fn broadcast_lossy(&mut self, frame: &Frame) {
        for link in &mut self.links {
            if let Err(err) = link.send(frame) {
                tracing::warn!(worker = link.peer(), %err, "abort notification failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload;
    use std::net::TcpListener;

    #[test]
    fn link_roundtrip_over_localhost() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut link = WorkerLink::from_stream(stream).unwrap();
            let frame = link.recv().unwrap();
            assert_eq!(frame.tag, FrameTag::PlanStep);
            link.send(&payload::plan_result(1, &[9.0, 8.0])).unwrap();
        });

        let mut link = WorkerLink::connect(&addr.to_string()).unwrap();
        link.send(&payload::plan_step(1, payload::Activation::F32(&[1.0]))).unwrap();
        let reply = link.recv_expect(FrameTag::PlanResult).unwrap();
        let (op_id, body) = payload::split_id(&reply.payload).unwrap();
        assert_eq!(op_id, 1);
        assert_eq!(payload::read_f32s(body, 2).unwrap(), vec![9.0, 8.0]);

        server.join().unwrap();
    }

    #[test]
    fn remote_error_surfaces_as_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut link = WorkerLink::from_stream(stream).unwrap();
            link.send(&payload::error_frame(crate::ErrorCode::PositionMismatch)).unwrap();
        });

        let mut link = WorkerLink::connect(&addr.to_string()).unwrap();
        let err = link.recv_expect(FrameTag::PlanResult).unwrap_err();
        assert!(matches!(err, ProtocolError::Remote(crate::ErrorCode::PositionMismatch)));

        server.join().unwrap();
    }
}
