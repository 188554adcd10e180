//! TCP accept loop and per-connection framing (spec.md 6)
//!
//! Each accepted connection gets a read half and a write half running as independent tasks: the
//! read half turns wire frames into [`WorkItem`]s and pushes them onto the shared work queue
//! (blocking on a full queue is the deliberate backpressure policy for protocol-originated
//! traffic — spec.md 4.1), the write half drains an unbounded per-client channel that only the
//! Controller task ever sends on.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::controller::WorkItem;
use crate::protocol::{ClientId, Frame, Value, WavemeterCodec, TARGET};

/// Hands out stable per-connection ids for the process lifetime.
#[derive(Default)]
pub struct ClientIdAllocator(AtomicU64);

impl ClientIdAllocator {
    pub fn next(&self) -> ClientId {
        ClientId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

pub async fn accept_loop(
    listener: TcpListener,
    work_tx: mpsc::Sender<WorkItem>,
    shutdown: broadcast::Sender<()>,
) {
    let ids = Arc::new(ClientIdAllocator::default());
    loop {
        let mut shutdown_rx = shutdown.subscribe();
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                info!("accept loop stopping");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let id = ids.next();
                        let work_tx = work_tx.clone();
                        let conn_shutdown = shutdown.subscribe();
                        tokio::spawn(async move {
                            handle_connection(stream, addr, id, work_tx, conn_shutdown).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    id: ClientId,
    work_tx: mpsc::Sender<WorkItem>,
    mut shutdown: broadcast::Receiver<()>,
) {
    debug!(%addr, ?id, "connection accepted");
    let framed = Framed::new(stream, WavemeterCodec);
    let (mut sink, mut stream) = framed.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                debug!(error = %e, "client write failed, closing connection");
                break;
            }
        }
    });

    let mut registered = false;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            next = stream.next() => {
                match next {
                    Some(Ok(frame)) => {
                        if frame.target != TARGET {
                            let _ = out_tx.send(Frame::nak(format!("unknown target {}", frame.target)));
                            continue;
                        }
                        if !registered {
                            match parse_con(&frame) {
                                Some(name) => {
                                    registered = true;
                                    if work_tx
                                        .send(WorkItem::Con { id, name, handle: out_tx.clone() })
                                        .await
                                        .is_err()
                                    {
                                        break;
                                    }
                                }
                                None => {
                                    let _ = out_tx.send(Frame::nak("first frame must be CON"));
                                }
                            }
                            continue;
                        }
                        match parse_work_item(id, &frame) {
                            Ok(item) => {
                                if work_tx.send(item).await.is_err() {
                                    break;
                                }
                            }
                            Err(reason) => {
                                let _ = out_tx.send(Frame::nak(reason));
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(?id, error = %e, "protocol error, closing connection");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    if registered {
        let _ = work_tx.send(WorkItem::Dcn { id }).await;
    }
    writer.abort();
    debug!(?id, "connection closed");
}

fn parse_con(frame: &Frame) -> Option<String> {
    if frame.command != "CON" {
        return None;
    }
    frame.data.first()?.as_str().map(str::to_string)
}

fn channel_arg(frame: &Frame) -> Result<String, String> {
    frame
        .data
        .first()
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("{} requires a channel name argument", frame.command))
}

fn f64_arg(frame: &Frame, index: usize) -> Result<f64, String> {
    frame
        .data
        .get(index)
        .and_then(Value::as_f64)
        .ok_or_else(|| format!("{} requires a numeric argument at position {index}", frame.command))
}

/// Turn an already-framed, already-registered command into a [`WorkItem`], or a NAK reason if the
/// command or its argument shape isn't one this server understands (spec.md 4.1's parse-boundary
/// NAK rule).
fn parse_work_item(id: ClientId, frame: &Frame) -> Result<WorkItem, String> {
    match frame.command.as_str() {
        "DCN" => Ok(WorkItem::Dcn { id }),
        "SRT" => Ok(WorkItem::Srt { id }),
        "STP" => Ok(WorkItem::Stp { id }),
        "KIL" => Ok(WorkItem::Kil { id }),
        "UON" => Ok(WorkItem::Uon { id, channel: channel_arg(frame)? }),
        "UOF" => Ok(WorkItem::Uof { id, channel: channel_arg(frame)? }),
        "PON" => Ok(WorkItem::Pon { id, channel: channel_arg(frame)? }),
        "POF" => Ok(WorkItem::Pof { id, channel: channel_arg(frame)? }),
        "FON" => Ok(WorkItem::Fon { id, channel: channel_arg(frame)? }),
        "FOF" => Ok(WorkItem::Fof { id, channel: channel_arg(frame)? }),
        "AEN" => Ok(WorkItem::Aen { id, channel: channel_arg(frame)? }),
        "AEF" => Ok(WorkItem::Aef { id, channel: channel_arg(frame)? }),
        "WMS" => Ok(WorkItem::Wms { id }),
        "SCF" => Ok(WorkItem::Scf { id, file: channel_arg(frame)? }),
        "TWL" => Ok(WorkItem::Twl {
            id,
            channel: channel_arg(frame)?,
            wavelength: f64_arg(frame, 1)?,
        }),
        "TFR" => Ok(WorkItem::Tfr {
            id,
            channel: channel_arg(frame)?,
            frequency: f64_arg(frame, 1)?,
        }),
        "EXP" => Ok(WorkItem::Exp {
            id,
            channel: channel_arg(frame)?,
            exposure: f64_arg(frame, 1)? as u32,
        }),
        "VLT" => Ok(WorkItem::Vlt {
            id,
            channel: channel_arg(frame)?,
            volts: f64_arg(frame, 1)?,
        }),
        "PPP" => Ok(WorkItem::Ppp { id, channel: channel_arg(frame)?, value: f64_arg(frame, 1)? }),
        "III" => Ok(WorkItem::Iii { id, channel: channel_arg(frame)?, value: f64_arg(frame, 1)? }),
        "DDD" => Ok(WorkItem::Ddd { id, channel: channel_arg(frame)?, value: f64_arg(frame, 1)? }),
        "GAN" => Ok(WorkItem::Gan { id, channel: channel_arg(frame)?, value: f64_arg(frame, 1)? }),
        other => Err(format!("unknown command {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_channel_commands() {
        let frame = Frame::control("UON", vec![Value::Str("Ch1".to_string())]);
        match parse_work_item(ClientId(1), &frame).unwrap() {
            WorkItem::Uon { channel, .. } => assert_eq!(channel, "Ch1"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_missing_argument() {
        let frame = Frame::control("UON", vec![]);
        assert!(parse_work_item(ClientId(1), &frame).is_err());
    }

    #[test]
    fn unknown_command_is_rejected() {
        let frame = Frame::control("ZZZ", vec![]);
        assert!(parse_work_item(ClientId(1), &frame).is_err());
    }

    #[test]
    fn con_requires_a_name() {
        let frame = Frame::control("CON", vec![Value::Str("alice".to_string())]);
        assert_eq!(parse_con(&frame), Some("alice".to_string()));
        let frame = Frame::control("CON", vec![]);
        assert_eq!(parse_con(&frame), None);
    }
}
