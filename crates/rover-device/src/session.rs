//! One connected Smart Device.
//!
//! A session is four cooperating tasks over one serial (or virtual TCP)
//! connection:
//!
//! * reader — splits the byte stream at frame delimiters, decodes, and
//!   enqueues inbound messages; protocol errors are answered with an `ERROR`
//!   frame and never kill the loop.
//! * writer — drains the outbound queue into encoded frames.
//! * handler — dispatches inbound messages by type into the shared buffer,
//!   heartbeat tracker, or log.
//! * poller — periodically drains the buffer's pending read/write bitmaps
//!   into `DEV_READ`/`DEV_WRITE` frames.
//!
//! Buffer operations cross the process-shared mutex, so they run on the
//! blocking pool.

use std::io;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info};

use rover_buffer::{Buffer, BufferError, BufferKey, BufferStore};
use rover_proto::{
    DeviceUid, ErrorCode, Message, MessageType, DELIMITER, MAX_ENCODED_SIZE,
};
use rover_rpc::RequestTracker;

use crate::DeviceError;

const QUEUE_SIZE: usize = 1024;
/// Fallback subscription interval when neither the caller nor the device
/// names one.
const DEFAULT_INTERVAL_MS: u16 = 40;

pub struct DeviceSession {
    buffers: Arc<BufferStore>,
    buffer: StdMutex<Option<Arc<Buffer>>>,
    heartbeats: RequestTracker<()>,
    read_tx: mpsc::Sender<Message>,
    read_rx: Mutex<mpsc::Receiver<Message>>,
    write_tx: mpsc::Sender<Message>,
    write_rx: Mutex<mpsc::Receiver<Message>>,
    port: String,
}

impl DeviceSession {
    pub fn new(buffers: Arc<BufferStore>, port: String) -> Self {
        let (read_tx, read_rx) = mpsc::channel(QUEUE_SIZE);
        let (write_tx, write_rx) = mpsc::channel(QUEUE_SIZE);
        Self {
            buffers,
            buffer: StdMutex::new(None),
            heartbeats: RequestTracker::new(u8::MAX as u32),
            read_tx,
            read_rx: Mutex::new(read_rx),
            write_tx,
            write_rx: Mutex::new(write_rx),
            port,
        }
    }

    /// The session's shared buffer; only present once discovery finished.
    pub fn buffer(&self) -> Result<Arc<Buffer>, DeviceError> {
        self.buffer
            .lock()
            .unwrap()
            .clone()
            .ok_or(DeviceError::NotDiscovered)
    }

    /// Run `f` against the buffer on the blocking pool (it takes the
    /// process-shared mutex).
    async fn with_buffer<T>(
        &self,
        f: impl FnOnce(&Buffer) -> Result<T, BufferError> + Send + 'static,
    ) -> Result<T, DeviceError>
    where
        T: Send + 'static,
    {
        let buffer = self.buffer()?;
        tokio::task::spawn_blocking(move || f(&buffer))
            .await
            .expect("buffer task panicked")
            .map_err(Into::into)
    }

    async fn enqueue(&self, message: Message) -> Result<(), DeviceError> {
        self.write_tx
            .send(message)
            .await
            .map_err(|_| DeviceError::Disconnected)
    }

    /// Read inbound frames until the transport fails.
    pub async fn read_messages<R>(self: Arc<Self>, reader: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut reader = BufReader::new(reader);
        let mut frame = Vec::with_capacity(MAX_ENCODED_SIZE + 1);
        loop {
            frame.clear();
            match read_frame(&mut reader, &mut frame).await {
                Ok(false) => {
                    debug!(port = %self.port, "serial stream closed");
                    return;
                }
                Ok(true) => {}
                Err(err) => {
                    debug!(port = %self.port, %err, "serial read failed");
                    return;
                }
            }
            if frame.is_empty() {
                continue;
            }
            match Message::decode(&frame) {
                Ok(message) => {
                    debug!(port = %self.port, ty = ?message.ty(), "read message");
                    if self.read_tx.send(message).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    error!(port = %self.port, %err, "message read error");
                    let _ = self
                        .write_tx
                        .send(Message::error(ErrorCode::for_decode_error(&err)))
                        .await;
                }
            }
        }
    }

    /// Write outbound frames until the transport fails.
    pub async fn write_messages<W>(self: Arc<Self>, writer: W)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut writer = writer;
        let mut write_rx = self.write_rx.lock().await;
        // One extra byte for the trailing delimiter.
        let mut buf = [0u8; MAX_ENCODED_SIZE + 1];
        while let Some(message) = write_rx.recv().await {
            let size = match message.encode_into(&mut buf) {
                Ok(size) => size,
                Err(err) => {
                    // Unencodable messages become a generic device error.
                    error!(port = %self.port, %err, "message write error");
                    Message::error(ErrorCode::GenericError)
                        .encode_into(&mut buf)
                        .expect("error frames always fit")
                }
            };
            buf[size] = DELIMITER;
            if let Err(err) = writer.write_all(&buf[..size + 1]).await {
                debug!(port = %self.port, %err, "serial write failed");
                return;
            }
            if let Err(err) = writer.flush().await {
                debug!(port = %self.port, %err, "serial flush failed");
                return;
            }
            debug!(port = %self.port, ty = ?message.ty(), "wrote message");
        }
    }

    /// Ping until the device answers with a `SUB_RES`, then allocate its
    /// buffer by device class and record the subscription state.
    pub async fn discover(&self) -> Result<DeviceUid, DeviceError> {
        let mut ping = tokio::time::interval(Duration::from_secs(1));
        let mut read_rx = self.read_rx.lock().await;
        loop {
            tokio::select! {
                _ = ping.tick() => {
                    self.enqueue(Message::ping()).await?;
                }
                message = read_rx.recv() => {
                    let message = message.ok_or(DeviceError::Disconnected)?;
                    if message.ty() != MessageType::SubRes {
                        debug!(port = %self.port, ty = ?message.ty(), "ignoring pre-discovery message");
                        continue;
                    }
                    let (_, _, uid) = message.read_sub_res()?;
                    let buffers = Arc::clone(&self.buffers);
                    let buffer = tokio::task::spawn_blocking(move || {
                        let buffer = buffers.get_or_create(BufferKey::Device(uid))?;
                        buffer.set_valid(true)?;
                        buffer.apply_sub_res(&message)?;
                        Ok::<_, BufferError>(buffer)
                    })
                    .await
                    .expect("buffer task panicked")?;
                    info!(
                        port = %self.port,
                        %uid,
                        device_type = %buffer.device_type().name,
                        "device discovered"
                    );
                    *self.buffer.lock().unwrap() = Some(buffer);
                    return Ok(uid);
                }
            }
        }
    }

    /// Dispatch inbound messages until the reader stops.
    pub async fn handle_messages(self: Arc<Self>) {
        let mut read_rx = self.read_rx.lock().await;
        while let Some(message) = read_rx.recv().await {
            if let Err(err) = self.handle(message).await {
                error!(port = %self.port, %err, "message handling error");
            }
        }
    }

    async fn handle(&self, message: Message) -> Result<(), DeviceError> {
        match message.ty() {
            MessageType::DevData => {
                self.with_buffer(move |buffer| buffer.update_data(&message))
                    .await
            }
            MessageType::SubRes => {
                self.with_buffer(move |buffer| buffer.apply_sub_res(&message))
                    .await
            }
            MessageType::HbReq => {
                let id = message.read_hb_req()?;
                self.enqueue(Message::hb_res(id)).await
            }
            MessageType::HbRes => {
                let id = message.read_hb_res()?;
                self.heartbeats
                    .resolve(id.into(), ())
                    .map_err(|_| DeviceError::UnknownHeartbeat(id))
            }
            MessageType::Error => Err(DeviceError::DeviceFault(message.read_error()?)),
            other => Err(DeviceError::UnhandledMessage(other)),
        }
    }

    /// Drain pending buffer reads/writes into outbound frames.
    pub async fn poll_buffer(&self) -> Result<(), DeviceError> {
        let messages = self
            .with_buffer(|buffer| {
                let mut messages = Vec::new();
                if let Some(message) = buffer.get_read()? {
                    messages.push(message);
                }
                messages.extend(buffer.get_write()?);
                Ok(messages)
            })
            .await?;
        for message in messages {
            self.enqueue(message).await?;
        }
        Ok(())
    }

    pub async fn poll_forever(self: Arc<Self>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            if let Err(err) = self.poll_buffer().await {
                match err {
                    DeviceError::Disconnected => return,
                    err => debug!(port = %self.port, %err, "buffer poll failed"),
                }
            }
        }
    }

    pub async fn ping(&self) -> Result<(), DeviceError> {
        self.enqueue(Message::ping()).await
    }

    pub async fn disable(&self) -> Result<(), DeviceError> {
        self.enqueue(Message::dev_disable()).await
    }

    pub async fn unsubscribe(&self) -> Result<(), DeviceError> {
        self.enqueue(Message::unsubscribe()).await
    }

    /// Subscribe to a parameter subset (`None` means all readable).
    pub async fn subscribe(
        &self,
        params: Option<Vec<String>>,
        interval: Option<f64>,
    ) -> Result<(), DeviceError> {
        let bitmap = self
            .with_buffer(move |buffer| {
                let refs: Option<Vec<&str>> =
                    params.as_ref().map(|p| p.iter().map(String::as_str).collect());
                buffer.readable_bitmap(refs.as_deref())
            })
            .await?;
        let interval_ms = match interval {
            Some(seconds) => {
                let ms = (seconds * 1000.0).round();
                if !(0.0..=f64::from(u16::MAX)).contains(&ms) {
                    return Err(DeviceError::IntervalOverflow(seconds));
                }
                ms as u16
            }
            None => match self.with_buffer(|buffer| buffer.delay_ms()).await? {
                0 => DEFAULT_INTERVAL_MS,
                delay => delay,
            },
        };
        self.enqueue(Message::sub_req(bitmap, interval_ms)).await
    }

    /// Flag parameters for an explicit read; the poller emits the frame.
    pub async fn read(&self, params: Option<Vec<String>>) -> Result<(), DeviceError> {
        self.with_buffer(move |buffer| {
            let names: Vec<String> = match params {
                Some(params) => params,
                None => buffer
                    .device_type()
                    .params
                    .iter()
                    .filter(|p| p.readable)
                    .map(|p| p.name.clone())
                    .collect(),
            };
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            buffer.set_read(&refs)
        })
        .await
    }

    /// Round-trip a heartbeat, returning the elapsed seconds.
    pub async fn heartbeat(
        &self,
        id: Option<u8>,
        timeout: Duration,
        block: bool,
    ) -> Result<f64, DeviceError> {
        let (id, reply) = self
            .heartbeats
            .register(id.map(u32::from))
            .map_err(|_| DeviceError::HeartbeatId)?;
        let start = Instant::now();
        self.enqueue(Message::hb_req(id as u8)).await?;
        if !block {
            self.heartbeats.discard(id);
            return Ok(0.0);
        }
        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(())) => Ok(start.elapsed().as_secs_f64()),
            _ => {
                self.heartbeats.discard(id);
                Err(DeviceError::HeartbeatTimeout)
            }
        }
    }
}

/// Read one delimited frame (without the delimiter) into `frame`.
/// Returns false at end of stream.
async fn read_frame<R>(reader: &mut BufReader<R>, frame: &mut Vec<u8>) -> io::Result<bool>
where
    R: AsyncRead + Unpin,
{
    loop {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(err) => return Err(err),
        };
        if byte == DELIMITER {
            return Ok(true);
        }
        frame.push(byte);
    }
}
