// cascade-net::tcp — PipelineLink over a full mesh of TCP connections.
//
// Every pair of stages shares one connection: the higher rank dials the
// lower one and opens with a Hello frame carrying its rank. A reader thread
// per connection decodes frames into a queue for that peer; ExitResult
// frames go to a separate queue so the first stage can take them from
// whichever stage answered.

use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use cascade_pipeline::{PipelineError, PipelineLink};
use cascade_types::config::LinkConfig;
use cascade_types::{FrameKind, PipelineStage, StageFrame};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::codec::{read_frame, write_frame};
use crate::error::{NetError, Result};

const DIAL_RETRY: Duration = Duration::from_millis(50);

pub struct TcpLink {
    stage: PipelineStage,
    max_frame_bytes: usize,
    /// Write half per peer, indexed by rank.
    peers: Vec<Option<TcpStream>>,
    /// Decoded frames per peer, indexed by rank.
    incoming: Vec<Option<mpsc::UnboundedReceiver<StageFrame>>>,
    results_tx: mpsc::UnboundedSender<StageFrame>,
    results_rx: mpsc::UnboundedReceiver<StageFrame>,
}

impl TcpLink {
    /// Join the mesh.
    ///
    /// `listener` is this stage's bound socket and `addrs[r]` the listening
    /// address of rank `r`. Blocks until every peer is connected or the
    /// connect timeout runs out.
    pub fn establish(
        stage: PipelineStage,
        listener: TcpListener,
        addrs: &[SocketAddr],
        config: &LinkConfig,
    ) -> Result<Self> {
        let n = stage.num_stages as usize;
        if addrs.len() != n {
            return Err(NetError::Handshake(format!(
                "{} addresses for {n} stages",
                addrs.len()
            )));
        }
        let rank = stage.rank;
        let deadline = Instant::now() + Duration::from_secs(config.connect_timeout_secs);
        let mut streams: Vec<Option<TcpStream>> = (0..n).map(|_| None).collect();

        for peer in 0..rank {
            let mut stream = dial(addrs[peer as usize], deadline)?;
            let hello = StageFrame::new(FrameKind::Hello, rank, Vec::new());
            write_frame(&mut stream, &hello, config.max_frame_bytes)?;
            debug!(stage = rank, peer, "dialed peer");
            streams[peer as usize] = Some(stream);
        }

        for _ in rank + 1..stage.num_stages {
            let (mut stream, remote) = listener.accept()?;
            let hello = read_frame(&mut stream, config.max_frame_bytes)?;
            let peer = hello.from_stage;
            if hello.kind != FrameKind::Hello || peer <= rank || peer >= stage.num_stages {
                return Err(NetError::Handshake(format!(
                    "unexpected {:?} from {remote} claiming stage {peer}",
                    hello.kind
                )));
            }
            if streams[peer as usize].is_some() {
                return Err(NetError::Handshake(format!("stage {peer} connected twice")));
            }
            debug!(stage = rank, peer, %remote, "accepted peer");
            streams[peer as usize] = Some(stream);
        }

        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let mut peers = Vec::with_capacity(n);
        let mut incoming = Vec::with_capacity(n);
        for (peer, stream) in streams.into_iter().enumerate() {
            match stream {
                Some(stream) => {
                    stream.set_nodelay(true)?;
                    let reader = stream.try_clone()?;
                    let (tx, rx) = mpsc::unbounded_channel();
                    spawn_reader(rank, peer as u32, reader, config.max_frame_bytes, tx, results_tx.clone())?;
                    peers.push(Some(stream));
                    incoming.push(Some(rx));
                }
                None => {
                    peers.push(None);
                    incoming.push(None);
                }
            }
        }

        info!(stage = rank, num_stages = n, "pipeline mesh established");
        Ok(Self {
            stage,
            max_frame_bytes: config.max_frame_bytes,
            peers,
            incoming,
            results_tx,
            results_rx,
        })
    }
}

impl Drop for TcpLink {
    // Reader threads hold a clone of each socket; shut down both halves so
    // they and the peers see end of stream.
    fn drop(&mut self) {
        for stream in self.peers.iter().flatten() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

fn dial(addr: SocketAddr, deadline: Instant) -> Result<TcpStream> {
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() < deadline => {
                debug!(%addr, error = %e, "peer not up yet");
                thread::sleep(DIAL_RETRY);
            }
            Err(e) => return Err(NetError::Io(e)),
        }
    }
}

fn spawn_reader(
    rank: u32,
    peer: u32,
    mut stream: TcpStream,
    max_frame_bytes: usize,
    frames: mpsc::UnboundedSender<StageFrame>,
    results: mpsc::UnboundedSender<StageFrame>,
) -> Result<()> {
    thread::Builder::new()
        .name(format!("cascade-link-{rank}-from-{peer}"))
        .spawn(move || loop {
            let frame = match read_frame(&mut stream, max_frame_bytes) {
                Ok(frame) => frame,
                Err(NetError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!(stage = rank, peer, "peer closed connection");
                    return;
                }
                Err(e) => {
                    warn!(stage = rank, peer, error = %e, "dropping connection");
                    return;
                }
            };
            let queue = if frame.kind == FrameKind::ExitResult { &results } else { &frames };
            if queue.send(frame).is_err() {
                return;
            }
        })?;
    Ok(())
}

impl PipelineLink for TcpLink {
    fn stage(&self) -> &PipelineStage {
        &self.stage
    }

    fn send_frame(&mut self, to: u32, frame: StageFrame) -> cascade_pipeline::Result<()> {
        let stream = self
            .peers
            .get_mut(to as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| PipelineError::Protocol(format!("no connection to stage {to}")))?;
        write_frame(stream, &frame, self.max_frame_bytes).map_err(Into::into)
    }

    fn recv_frame(&mut self, from: u32) -> cascade_pipeline::Result<StageFrame> {
        let rx = self
            .incoming
            .get_mut(from as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| PipelineError::Protocol(format!("no connection from stage {from}")))?;
        rx.blocking_recv()
            .ok_or_else(|| NetError::Disconnected(from).into())
    }

    fn send_result_frame(&mut self, frame: StageFrame) -> cascade_pipeline::Result<()> {
        if self.stage.is_first() {
            return self
                .results_tx
                .send(frame)
                .map_err(|_| PipelineError::Protocol("result queue closed".into()));
        }
        self.send_frame(0, frame)
    }

    fn recv_result_frame(&mut self) -> cascade_pipeline::Result<StageFrame> {
        self.results_rx
            .blocking_recv()
            .ok_or_else(|| PipelineError::Protocol("result queue closed".into()))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
