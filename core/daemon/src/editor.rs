//! TCP adapter between editor plugins and the runtime.
//!
//! Each connection gets a reader loop that decodes `[index, {event, ts, data}]`
//! lines, a writer task that owns the socket's write half, and a forwarder
//! that copies timer pushes from the broadcast channel into the writer.

use digitme_protocol::{encode_reply, parse_editor_line, Push, MAX_REQUEST_BYTES};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::runtime::Input;

pub async fn serve(
    listener: TcpListener,
    inputs: mpsc::UnboundedSender<Input>,
    pushes: broadcast::Sender<Push>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!(peer = %peer, "Editor client connected");
                let inputs = inputs.clone();
                let pushes = pushes.subscribe();
                tokio::spawn(async move {
                    handle_client(stream, inputs, pushes).await;
                    info!(peer = %peer, "Editor client disconnected");
                });
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept editor connection");
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    inputs: mpsc::UnboundedSender<Input>,
    mut pushes: broadcast::Receiver<Push>,
) {
    let (reader, mut writer) = stream.into_split();
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();

    let writer_task = tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            if let Err(err) = writer.write_all(line.as_bytes()).await {
                debug!(error = %err, "Editor write failed");
                break;
            }
        }
    });

    let push_tx = line_tx.clone();
    let push_task = tokio::spawn(async move {
        loop {
            match pushes.recv().await {
                Ok(push) => match push.encode() {
                    Ok(encoded) => {
                        if push_tx.send(format!("{}\n", encoded)).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(error = %err, "Failed to encode push"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Editor client lagged; pushes dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match read_line_bounded(&mut reader, &mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(error = %err, "Editor read failed");
                break;
            }
        }

        let request = match parse_editor_line(&line) {
            Ok(request) => request,
            Err(info) if info.code == "empty_request" => continue,
            Err(info) => {
                warn!(code = %info.code, message = %info.message, "Invalid editor message");
                continue;
            }
        };

        let index = request.index;
        if !request.event.expects_reply() {
            if inputs.send(Input::Editor { request, reply: None }).is_err() {
                break;
            }
            continue;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        if inputs
            .send(Input::Editor {
                request,
                reply: Some(reply_tx),
            })
            .is_err()
        {
            break;
        }
        let Ok(reply) = reply_rx.await else {
            continue;
        };
        match encode_reply(index, &reply) {
            Ok(encoded) => {
                if line_tx.send(format!("{}\n", encoded)).is_err() {
                    break;
                }
            }
            Err(err) => warn!(error = %err, index, "Failed to encode reply"),
        }
    }

    push_task.abort();
    drop(line_tx);
    let _ = writer_task.await;
}

/// Reads one line, keeping at most `MAX_REQUEST_BYTES + 1` bytes of it. The
/// remainder of an oversized line is consumed and discarded.
async fn read_line_bounded<R>(reader: &mut R, line: &mut Vec<u8>) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let limit = MAX_REQUEST_BYTES as u64 + 1;
    let read = (&mut *reader).take(limit).read_until(b'\n', line).await?;
    if line.len() > MAX_REQUEST_BYTES && line.last() != Some(&b'\n') {
        let mut discard = Vec::new();
        loop {
            discard.clear();
            let skipped = (&mut *reader).take(limit).read_until(b'\n', &mut discard).await?;
            if skipped == 0 || discard.last() == Some(&b'\n') {
                break;
            }
        }
    }
    Ok(read)
}
