use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::{mpsc::channel, Arc};
use std::thread;
use std::time::Duration;

use futures::{
    channel::{
        mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    sink::SinkExt,
    stream::StreamExt,
};

use log::{debug, error, trace, warn};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{sleep_until, Instant};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, StopBits};
use tokio_util::codec::*;

use crate::error::*;
use crate::frame::*;
use crate::listener::Listeners;

/// How long the modem has to echo a command back.
const ECHO_TIMEOUT: Duration = Duration::from_secs(2);

pub enum BrokerMessage {
    AddListener {
        listener: UnboundedSender<Frame>,
    },
    SendFrame {
        frame: Frame,
        responder: oneshot::Sender<Result<Frame, Error>>,
    },
}

struct Pending {
    frame: Frame,
    responder: oneshot::Sender<Result<Frame, Error>>,
    deadline: Instant,
}

/// Owns the modem's I/O on a thread of its own. Commands are written one at
/// a time: the next is only sent once the modem echoed the previous one or
/// the echo timed out. Everything else the modem says goes to listeners.
#[derive(Clone)]
pub struct Broker {
    sender: UnboundedSender<BrokerMessage>,
    listeners: Arc<Listeners>,
}

fn dispatch(
    frame: &Frame,
    frame_listeners: &mut Vec<UnboundedSender<Frame>>,
    listeners: &Listeners,
) {
    if let Frame::InsteonReceive(message) = frame {
        debug!("Received {}", message);
        listeners.deliver(message);
    }

    frame_listeners.retain(|listener| listener.unbounded_send(frame.clone()).is_ok());
}

async fn event_loop(
    mut receiver: UnboundedReceiver<BrokerMessage>,
    mut framed: Framed<impl AsyncRead + AsyncWrite + Unpin, FrameCodec>,
    listeners: Arc<Listeners>,
) {
    let mut frame_listeners = Vec::<UnboundedSender<Frame>>::new();
    let mut queue = VecDeque::new();
    let mut pending: Option<Pending> = None;

    loop {
        while pending.is_none() {
            let (frame, responder): (Frame, oneshot::Sender<_>) = match queue.pop_front() {
                Some(next) => next,
                None => break,
            };

            debug!("Sending Frame: {:02x?}", frame);
            match framed.send(frame.clone()).await {
                Ok(()) => {
                    pending = Some(Pending {
                        frame,
                        responder,
                        deadline: Instant::now() + ECHO_TIMEOUT,
                    })
                }
                Err(e) => {
                    let _ = responder.send(Err(e));
                }
            }
        }

        let deadline = pending
            .as_ref()
            .map(|p| p.deadline)
            .unwrap_or_else(|| Instant::now() + ECHO_TIMEOUT);

        tokio::select! {
            biased;

            maybe_frame = framed.next() => match maybe_frame {
                Some(Ok(frame)) => {
                    trace!("Received Frame: {:02x?}", frame);
                    match pending.take() {
                        Some(p) if p.frame.is_response(&frame) => {
                            debug!("Received Response: {:02x?}", frame);
                            let result = match frame {
                                Frame::Nak(_) => Err(Error::NotAcknowledged),
                                frame => Ok(frame),
                            };
                            let _ = p.responder.send(result);
                        }
                        other => {
                            pending = other;
                            dispatch(&frame, &mut frame_listeners, &listeners);
                        }
                    }
                }
                Some(Err(e)) => {
                    error!("Failed to read from modem: {}", e);
                    if let Some(p) = pending.take() {
                        let _ = p.responder.send(Err(e));
                    }
                    break;
                }
                None => {
                    debug!("Modem closed");
                    break;
                }
            },

            _ = sleep_until(deadline), if pending.is_some() => {
                if let Some(p) = pending.take() {
                    warn!("Modem did not echo {:02x?}", p.frame);
                    let _ = p.responder.send(Err(Error::Timeout));
                }
            },

            msg = receiver.next() => match msg {
                Some(BrokerMessage::AddListener { listener }) => {
                    frame_listeners.push(listener);
                }
                Some(BrokerMessage::SendFrame { frame, responder }) => {
                    queue.push_back((frame, responder));
                }
                None => break, // No more messages coming, exit
            },
        }
    }

    for (_, responder) in queue.drain(..) {
        let _ = responder.send(Err(Error::Disconnected));
    }
}

fn runtime() -> io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
}

impl Broker {
    pub fn from_path(path: impl AsRef<Path> + Send + 'static) -> Result<Broker, io::Error> {
        let (sender, receiver) = unbounded();
        let listeners = Listeners::new();
        let event_listeners = listeners.clone();

        let (init_sender, init_receiver) = channel();

        thread::spawn(move || {
            let rt = match runtime() {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = init_sender.send(Err(e));
                    return;
                }
            };

            rt.block_on(async move {
                let port = tokio_serial::new(path.as_ref().to_string_lossy(), 19200)
                    .data_bits(DataBits::Eight)
                    .flow_control(FlowControl::None)
                    .parity(Parity::None)
                    .stop_bits(StopBits::One)
                    .timeout(Duration::from_millis(100))
                    .open_native_async();

                match port {
                    Ok(port) => {
                        let _ = init_sender.send(Ok(()));
                        event_loop(receiver, Framed::new(port, FrameCodec()), event_listeners).await
                    }
                    Err(e) => {
                        let _ = init_sender.send(Err(e.into()));
                    }
                }
            });
        });

        // Make sure we were able to create the port
        init_receiver
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "modem thread exited"))??;
        Ok(Broker { sender, listeners })
    }

    pub fn new(handle: impl AsyncRead + AsyncWrite + Unpin + Send + 'static) -> Broker {
        let (sender, receiver) = unbounded();
        let listeners = Listeners::new();
        let event_listeners = listeners.clone();

        thread::spawn(move || match runtime() {
            Ok(rt) => rt.block_on(event_loop(
                receiver,
                Framed::new(handle, FrameCodec()),
                event_listeners,
            )),
            // Dropping the receiver disconnects every handle.
            Err(e) => error!("Unable to start modem runtime: {}", e),
        });

        Broker { sender, listeners }
    }

    /// Writes `frame` and waits for the modem's echo. A NAK echo is
    /// [Error::NotAcknowledged].
    pub async fn send(&self, frame: Frame) -> Result<Frame, Error> {
        let (responder, response) = oneshot::channel();
        self.sender
            .unbounded_send(BrokerMessage::SendFrame { frame, responder })?;
        response.await?
    }

    /// Every frame the modem sends that is not an echo.
    pub fn listen(&self) -> Result<UnboundedReceiver<Frame>, Error> {
        let (sender, receiver) = unbounded();
        self.sender
            .unbounded_send(BrokerMessage::AddListener { listener: sender })?;
        Ok(receiver)
    }

    /// Subscribers to received INSTEON messages.
    pub fn listeners(&self) -> &Arc<Listeners> {
        &self.listeners
    }
}
