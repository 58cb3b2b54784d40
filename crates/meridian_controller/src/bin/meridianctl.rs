// Console client for a running Meridian controller.
//
// Joins the target controller as a console peer, then either reports the
// join result (`ping`) or submits a data operation for the controller to
// proxy through a query node (`data`).

use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use meridian_controller::node::{NodeDefinition, NodeType};
use meridian_controller::wire::{
    DataOperation, Frame, FrameCodec, JoinAttempt, Payload, PeerSettings,
};

const IO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "meridianctl", about = "Console client for a Meridian controller")]
struct Args {
    /// Controller address as `host:port`.
    #[arg(long, env = "MERIDIAN_TARGET")]
    target: NodeDefinition,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Join as a console peer and report whether the target is primary.
    Ping,
    /// Submit a JSON data operation; the controller proxies it to a query
    /// node and relays the answer.
    Data { body: String },
}

type Link = Framed<TcpStream, FrameCodec>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let socket = TcpStream::connect((args.target.host.as_str(), args.target.port))
        .await
        .with_context(|| format!("connect to {}", args.target))?;
    let local = socket.local_addr().context("resolve local address")?;
    let mut link = Framed::new(socket, FrameCodec);

    let join = Payload::JoinAttempt(JoinAttempt {
        node_type: NodeType::Console,
        name: local.ip().to_string(),
        port: local.port(),
        settings: PeerSettings::None,
        is_primary_claim: false,
    });
    let success = match request(&mut link, &join).await? {
        Payload::JoinSuccess(success) => success,
        Payload::JoinFailure(failure) => bail!("join refused: {}", failure.reason),
        other => bail!("unexpected join response: {}", other.kind()),
    };

    match args.cmd {
        Command::Ping => {
            println!(
                "joined {} (primary: {})",
                args.target, success.primary_controller
            );
        }
        Command::Data { body } => {
            let body = serde_json::from_str(&body).context("parse operation body as JSON")?;
            let operation = Payload::DataOperation(DataOperation { body });
            let reply = request(&mut link, &operation).await?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
    }
    Ok(())
}

/// Send a waiting request and read frames until its response arrives.
async fn request(link: &mut Link, payload: &Payload) -> anyhow::Result<Payload> {
    let frame = Frame::request(payload, true)?;
    let id = frame.id;
    link.send(frame).await.context("send request")?;
    loop {
        let frame = tokio::time::timeout(IO_TIMEOUT, link.next())
            .await
            .context("timed out waiting for response")?
            .context("connection closed")?
            .context("read frame")?;
        if frame.in_response_to == id {
            return frame.decode_payload();
        }
        // Unrelated push (node lists, chunk updates); skip it.
    }
}
