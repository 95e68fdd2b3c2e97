//! CLI entrypoint: the external collaborator that drives the core library's public surface
//! (parse metainfo → build download task → stream piece results with offsets) and owns
//! everything the spec calls out as out of scope for the core — argument parsing, progress
//! rendering, random peer-id generation, and writing verified pieces to disk.
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use rand::RngCore;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{error, info, warn};

use rs_torrent_client::download::DoneState;
use rs_torrent_client::torrent::parse_metainfo;

#[derive(Parser, Debug)]
#[command(name = "rstc", about = "A BitTorrent v1 single-file downloader")]
struct Cli {
    /// Path to the .torrent metainfo file.
    #[arg(long)]
    file: PathBuf,

    /// Port advertised to the tracker as this client's listening port.
    #[arg(long, default_value_t = 6881)]
    port: u16,
}

/// Builds a 20-byte peer id: an 8-byte client identifier followed by 12 random bytes.
fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let prefix = b"-RT0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    rand::rng().fill_bytes(&mut peer_id[prefix.len()..]);
    peer_id
}

async fn preallocate_output(name: &str, length: i64) -> std::io::Result<File> {
    let file = File::create(name).await?;
    file.set_len(length.max(0) as u64).await?;
    Ok(file)
}

async fn write_piece_at(file: &mut File, offset: u64, data: &[u8]) -> std::io::Result<()> {
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let bytes = match tokio::fs::read(&cli.file).await {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(file = %cli.file.display(), %err, "failed to read torrent file");
            return ExitCode::FAILURE;
        }
    };

    let metainfo = match parse_metainfo(&bytes) {
        Ok(mi) => mi,
        Err(err) => {
            error!(%err, "failed to parse metainfo");
            return ExitCode::FAILURE;
        }
    };

    info!(
        info_hash = %hex::encode(metainfo.info_hash),
        name = %metainfo.info.name,
        pieces = metainfo.num_pieces(),
        "parsed torrent"
    );

    let peer_id = generate_peer_id();
    let task = match metainfo.build_task(peer_id, cli.port).await {
        Ok(task) => task,
        Err(err) => {
            error!(%err, "tracker announce failed");
            return ExitCode::FAILURE;
        }
    };

    let mut output = match preallocate_output(&metainfo.info.name, metainfo.total_length()).await {
        Ok(file) => file,
        Err(err) => {
            error!(%err, file = %metainfo.info.name, "failed to create output file");
            return ExitCode::FAILURE;
        }
    };

    let total_pieces = metainfo.num_pieces();
    let mut ctx = task.start();
    let mut done_rx = ctx.subscribe_done();
    let mut progress_timer = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            result = ctx.results().recv() => {
                if let Ok(piece) = result {
                    let (begin, _end) = ctx.piece_bounds(piece.index);
                    if let Err(err) = write_piece_at(&mut output, begin, &piece.data).await {
                        error!(%err, index = piece.index, "failed to write piece to output file");
                        return ExitCode::FAILURE;
                    }
                }
            }
            error = ctx.errors().recv() => {
                if let Ok(err) = error {
                    warn!(%err, "download error");
                }
            }
            _ = progress_timer.tick() => {
                let (bytes_done, pieces_done) = ctx.progress();
                info!(pieces_done, total_pieces, bytes_done, peers = ctx.peers().len(), "progress");
            }
            changed = done_rx.changed() => {
                if changed.is_err() {
                    error!("download context closed without signaling completion");
                    return ExitCode::FAILURE;
                }
                match *done_rx.borrow() {
                    DoneState::Completed => {
                        info!("download complete");
                        return ExitCode::SUCCESS;
                    }
                    DoneState::Stalled => {
                        error!("download stalled: no remaining peer could serve the unfinished pieces");
                        return ExitCode::FAILURE;
                    }
                    DoneState::Pending => continue,
                }
            }
        }
    }
}
