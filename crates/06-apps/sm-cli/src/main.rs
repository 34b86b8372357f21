//! Operator utility for the shared-memory transport: run an echo server,
//! ping it, and clean up after crashed processes.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::{unbounded, Receiver};
use na_sm::{
    cleanup, Completion, CompletionInfo, NaError, OpKind, ProcessRegistry, ProgressMode, SmConfig,
    SmEndpoint,
};
use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};

const TICK: Duration = Duration::from_millis(100);

/// Exercise the na-sm shared-memory transport.
#[derive(Parser, Debug)]
#[command(author, version, about = "Shared-memory transport utility", long_about = None)]
struct Cli {
    #[command(flatten)]
    naming: NamingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct NamingArgs {
    /// Root directory of rendezvous sockets.
    #[arg(long, env = "NA_SM_TMP_DIR", default_value = "/tmp")]
    tmp_dir: PathBuf,
    /// Directory holding named shared-memory regions.
    #[arg(long, env = "NA_SM_SHM_DIR", default_value = "/dev/shm")]
    shm_dir: PathBuf,
    /// Prefix of every generated name.
    #[arg(long, env = "NA_SM_PREFIX", default_value = "na_sm")]
    prefix: String,
    /// User name embedded in generated names (defaults to the effective user).
    #[arg(long, env = "NA_SM_USERNAME")]
    username: Option<String>,
    /// Busy-poll the command ring instead of waiting on descriptors.
    #[arg(long)]
    no_block: bool,
}

impl NamingArgs {
    fn config(&self, listen: bool) -> SmConfig {
        SmConfig {
            listen,
            progress_mode: if self.no_block {
                ProgressMode::NoBlock
            } else {
                ProgressMode::Blocking
            },
            username: self.username.clone(),
            prefix: self.prefix.clone(),
            tmp_dir: self.tmp_dir.clone(),
            shm_dir: self.shm_dir.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Remove sockets and regions left behind by this user's processes.
    Cleanup,
    /// Listen and echo every unexpected message back as an expected reply.
    Serve {
        /// Stop after this many messages.
        #[arg(long)]
        count: Option<u64>,
    },
    /// Send messages to a server and wait for the echoes.
    Ping {
        /// Server address, `sm://<pid>/<id>`.
        addr: String,
        /// Number of round trips.
        #[arg(short, long, default_value_t = 4)]
        count: u32,
        /// Payload size in bytes.
        #[arg(short, long, default_value_t = 64)]
        size: usize,
        /// Seconds to wait for each reply.
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Cleanup => {
            cleanup(&cli.naming.config(false)).context("cleanup failed")?;
        }
        Command::Serve { count } => serve(cli.naming.config(true), count)?,
        Command::Ping {
            addr,
            count,
            size,
            timeout,
        } => ping(
            cli.naming.config(false),
            &addr,
            count,
            size,
            Duration::from_secs(timeout),
        )?,
    }
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(env_filter).try_init();
}

fn open(config: SmConfig) -> Result<(SmEndpoint, Receiver<Completion>)> {
    let (tx, rx) = unbounded();
    let endpoint =
        SmEndpoint::open(config, ProcessRegistry::global(), tx).context("failed to open endpoint")?;
    Ok((endpoint, rx))
}

/// Progresses `endpoint` until a completion arrives or `deadline` passes.
fn next_completion(
    endpoint: &SmEndpoint,
    completions: &Receiver<Completion>,
    deadline: Option<Instant>,
) -> Result<Completion> {
    loop {
        if let Ok(done) = completions.try_recv() {
            return Ok(done);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            bail!("timed out waiting for a completion");
        }
        match endpoint.progress(TICK) {
            Ok(()) | Err(NaError::Timeout) => {}
            Err(err) => return Err(err).context("progress failed"),
        }
    }
}

fn serve(config: SmConfig, count: Option<u64>) -> Result<()> {
    let (mut endpoint, completions) = open(config)?;
    let me = endpoint.addr_self();
    println!("listening on {}", endpoint.addr_to_string(me)?);
    endpoint.addr_free(me)?;

    let recv = endpoint.op_create();
    let send = endpoint.op_create();
    let mut served = 0u64;
    while count.map_or(true, |limit| served < limit) {
        let buf = vec![0; endpoint.msg_max_unexpected_size()];
        endpoint.msg_recv_unexpected(buf, 0, recv)?;
        let request = next_completion(&endpoint, &completions, None)?;
        request.result.context("receive failed")?;
        let CompletionInfo::RecvUnexpected {
            mut buf,
            actual_size,
            tag,
            source: Some(source),
        } = request.info
        else {
            bail!("unexpected completion {:?}", request.kind);
        };
        buf.truncate(actual_size);
        debug!(tag, size = actual_size, "echoing");

        endpoint.msg_send_expected(source, buf, tag, 0, send)?;
        loop {
            let done = next_completion(&endpoint, &completions, None)?;
            if done.op == send {
                done.result.context("reply failed")?;
                break;
            }
        }
        endpoint.addr_free(source)?;
        served += 1;
    }

    endpoint.op_destroy(recv)?;
    endpoint.op_destroy(send)?;
    endpoint.close()?;
    info!(served, "server done");
    Ok(())
}

fn ping(config: SmConfig, addr: &str, count: u32, size: usize, timeout: Duration) -> Result<()> {
    let (mut endpoint, completions) = open(config)?;
    let server = endpoint
        .addr_lookup(addr)
        .with_context(|| format!("cannot reach {addr}"))?;
    if size > endpoint.msg_max_unexpected_size() {
        bail!("payload of {size} bytes exceeds the {} byte limit", endpoint.msg_max_unexpected_size());
    }

    let recv = endpoint.op_create();
    let send = endpoint.op_create();
    for seq in 0..count {
        let payload: Vec<u8> = (0..size).map(|i| (i as u32 ^ seq) as u8).collect();
        let started = Instant::now();
        endpoint.msg_recv_expected(server, vec![0; size], seq, 0, recv)?;
        endpoint.msg_send_unexpected(server, payload.clone(), seq, 0, send)?;

        let deadline = started + timeout;
        let reply = loop {
            let done = next_completion(&endpoint, &completions, Some(deadline))?;
            done.result.with_context(|| format!("{:?} failed", done.kind))?;
            if done.kind == OpKind::RecvExpected {
                break done;
            }
        };
        if reply.received() != Some(&payload[..]) {
            bail!("echo {seq} does not match the request");
        }
        println!("{size} bytes from {addr}: seq={seq} time={:?}", started.elapsed());
    }

    // The send may still be completing.
    while endpoint.op_destroy(send).is_err() {
        next_completion(&endpoint, &completions, Some(Instant::now() + timeout))?;
    }
    endpoint.op_destroy(recv)?;
    endpoint.addr_free(server)?;
    endpoint.close()?;
    Ok(())
}
