use anyhow::{Context, Result};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{info, warn};

use crate::cli::ClientArgs;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut sink, mut source) = establish_connection(&args).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&mut sink, &mut source, &mut stdin, &mut input).await?;
    shutdown_connection(&mut sink).await;

    Ok(())
}

async fn establish_connection(args: &ClientArgs) -> Result<(WsSink, WsSource)> {
    let url = format!("ws://{}", args.server);
    let (socket, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect to {url}"))?;

    info!("connected to {}", args.server);

    Ok(socket.split())
}

async fn run_client_loop(
    sink: &mut WsSink,
    source: &mut WsSource,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            frame = source.next() => {
                if !handle_server_frame(frame).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, sink).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_frame(frame: Option<Result<Message, WsError>>) -> Result<bool> {
    match frame {
        Some(Ok(Message::Text(token))) => {
            write_stdout(token.as_str()).await?;
            Ok(true)
        }
        Some(Ok(Message::Close(_))) | None => {
            write_stdout("*** relay closed the connection").await?;
            Ok(false)
        }
        Some(Ok(_)) => Ok(true),
        Some(Err(err)) => Err(err.into()),
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    sink: &mut WsSink,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let command = input.trim_end();
    if command.is_empty() {
        return Ok(true);
    }

    sink.send(Message::text(command)).await?;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(sink: &mut WsSink) {
    if let Err(error) = sink.close().await {
        warn!(?error, "failed to close connection cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
