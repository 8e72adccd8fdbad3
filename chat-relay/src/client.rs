use std::{io, net::SocketAddr};

use anyhow::{Context, Result, bail};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    message::{ChatMessage, read_message, write_message},
};

/// A connected stream to the relay.
pub struct ChatClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ChatClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        info!("connected to {addr}");

        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    pub fn into_split(
        self,
    ) -> (
        ClientSender<OwnedWriteHalf>,
        ClientReceiver<BufReader<OwnedReadHalf>>,
    ) {
        (
            ClientSender::new(self.writer),
            ClientReceiver::new(self.reader),
        )
    }
}

pub struct ClientSender<W> {
    writer: W,
}

impl<W> ClientSender<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Sends `text` as `sender`. Blank text never reaches the network and
    /// yields `Ok(false)`.
    pub async fn send_message(&mut self, sender: &str, text: &str) -> io::Result<bool> {
        if text.trim().is_empty() {
            return Ok(false);
        }

        write_message(&mut self.writer, &ChatMessage::new(sender, text)).await?;
        Ok(true)
    }

    pub async fn close(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

#[derive(Debug)]
pub enum ClientEvent {
    Message(ChatMessage),
    Closed,
    Error(io::Error),
}

pub struct ClientReceiver<R> {
    reader: R,
}

impl<R> ClientReceiver<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reports every inbound message, then exactly one `Closed` or `Error`.
    pub async fn receive_loop<F>(mut self, mut on_event: F)
    where
        F: FnMut(ClientEvent),
    {
        loop {
            match read_message::<_, ChatMessage>(&mut self.reader).await {
                Ok(Some(message)) => on_event(ClientEvent::Message(message)),
                Ok(None) => {
                    on_event(ClientEvent::Closed);
                    return;
                }
                Err(err) => {
                    on_event(ClientEvent::Error(err));
                    return;
                }
            }
        }
    }
}

/// Line-oriented terminal client: stdin lines go out under `args.name`,
/// inbound messages print as `<sender> text`.
pub async fn run(args: ClientArgs) -> Result<()> {
    let name = args.name.trim().to_string();
    if name.is_empty() {
        bail!("name cannot be empty");
    }

    let (mut sender, receiver) = ChatClient::connect(args.server).await?.into_split();
    write_stdout(&format!("*** connected as {name}")).await?;

    let (events_tx, events) = mpsc::unbounded_channel();
    tokio::spawn(receiver.receive_loop(move |event| {
        let _ = events_tx.send(event);
    }));

    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(?error, "ctrl-c handler failed");
        }
    };
    let stdin = BufReader::new(tokio::io::stdin());
    let result = chat_loop(&name, stdin, &mut sender, events, ctrl_c).await;

    if let Err(error) = sender.close().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
    result
}

/// Runs until input ends, `/quit`, the relay goes away, or `shutdown` fires.
///
/// Input goes through [`tokio::io::Lines::next_line`], which keeps a partially typed
/// line buffered when an inbound message wins the `select!`.
async fn chat_loop<I, W, S>(
    name: &str,
    input: I,
    sender: &mut ClientSender<W>,
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
    shutdown: S,
) -> Result<()>
where
    I: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut lines = input.lines();

    loop {
        select! {
            event = events.recv() => {
                if !handle_event(event).await? {
                    break;
                }
            }
            line = lines.next_line() => {
                if !handle_stdin_input(line, name, sender).await? {
                    break;
                }
            }
            _ = &mut shutdown => break,
        }
    }

    Ok(())
}

async fn handle_event(event: Option<ClientEvent>) -> Result<bool> {
    match event {
        Some(ClientEvent::Message(ChatMessage { sender, message })) => {
            write_stdout(&format!("<{sender}> {message}")).await?;
            Ok(true)
        }
        Some(ClientEvent::Error(err)) => {
            write_stderr(&format!("!!! connection error: {err}")).await?;
            Ok(false)
        }
        Some(ClientEvent::Closed) | None => {
            write_stdout("*** relay closed the connection").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input<W>(
    line: io::Result<Option<String>>,
    name: &str,
    sender: &mut ClientSender<W>,
) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let Some(line) = line.context("failed to read stdin")? else {
        return Ok(false);
    };

    let text = line.trim_end();
    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    sender
        .send_message(name, text)
        .await
        .context("failed to send message")?;
    Ok(true)
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
