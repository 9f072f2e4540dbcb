//! `walbctl` — one subcommand per control-interface row of §6, calling
//! straight into [`walb::control`] with no separate daemon to talk to.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use walb::control::{format_ldev, StartParams, WalbControl};
use walb::error::WalbError;

#[derive(Parser)]
#[command(name = "walbctl", about = "control a walb write-ahead-log device")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Format a log device: write super sectors, zero the snapshot region,
    /// write an end-marker pack at lsid 0.
    FormatLdev {
        #[arg(long)]
        ldev: String,
        #[arg(long, default_value_t = 512)]
        logical_bs: u32,
        #[arg(long, default_value_t = 4096)]
        physical_bs: u32,
        #[arg(long)]
        ldev_size_lb: u64,
        #[arg(long)]
        ddev_size_lb: u64,
        #[arg(long, default_value_t = 64)]
        n_snapshots: u32,
        #[arg(long)]
        name: String,
    },
    /// Replay the log onto the data device and report the resulting state.
    CreateDev {
        #[arg(long)]
        ldev: String,
        #[arg(long)]
        ddev: String,
        #[arg(long, default_value_t = 256)]
        max_logpack_kb: u32,
    },
    /// Flush pending writes and checkpoint the super sector.
    TakeCheckpoint {
        #[arg(long)]
        ldev: String,
        #[arg(long)]
        ddev: String,
    },
    /// Append one write to the log and data devices, reading the payload
    /// bytes from a file.
    SubmitWrite {
        #[arg(long)]
        ldev: String,
        #[arg(long)]
        ddev: String,
        #[arg(long)]
        offset_lb: u64,
        #[arg(long)]
        data_file: String,
    },
    /// Print `oldest_lsid`, `written_lsid`, log usage and capacity.
    Status {
        #[arg(long)]
        ldev: String,
        #[arg(long)]
        ddev: String,
    },
    /// Advance `oldest_lsid` (must not exceed `written_lsid`).
    SetOldestLsid {
        #[arg(long)]
        ldev: String,
        #[arg(long)]
        ddev: String,
        #[arg(long)]
        lsid: u64,
    },
    /// Grow the recorded data-device size (0 = autodetect from file length).
    Resize {
        #[arg(long)]
        ldev: String,
        #[arg(long)]
        ddev: String,
        #[arg(long, default_value_t = 0)]
        new_size_lb: u64,
    },
    /// Online re-initialization of the log device only.
    ResetWal {
        #[arg(long)]
        ldev: String,
        #[arg(long)]
        ddev: String,
    },
    /// Quiesce I/O.
    Freeze {
        #[arg(long)]
        ldev: String,
        #[arg(long)]
        ddev: String,
        #[arg(long, default_value_t = 30)]
        timeout_sec: u32,
    },
    /// Resume I/O after a freeze.
    Melt {
        #[arg(long)]
        ldev: String,
        #[arg(long)]
        ddev: String,
    },
    /// Add a named snapshot at the given lsid.
    SnapshotAdd {
        #[arg(long)]
        ldev: String,
        #[arg(long)]
        ddev: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        lsid: u64,
        #[arg(long)]
        timestamp: u64,
    },
    /// Delete a snapshot by name.
    SnapshotDel {
        #[arg(long)]
        ldev: String,
        #[arg(long)]
        ddev: String,
        #[arg(long)]
        name: String,
    },
    /// Delete every snapshot in `[lsid0, lsid1)`.
    SnapshotDelRange {
        #[arg(long)]
        ldev: String,
        #[arg(long)]
        ddev: String,
        #[arg(long)]
        lsid0: u64,
        #[arg(long)]
        lsid1: u64,
    },
    /// Print a single snapshot by name.
    SnapshotGet {
        #[arg(long)]
        ldev: String,
        #[arg(long)]
        ddev: String,
        #[arg(long)]
        name: String,
    },
    /// List every snapshot in `[lsid0, lsid1)`, in lsid order.
    SnapshotListRange {
        #[arg(long)]
        ldev: String,
        #[arg(long)]
        ddev: String,
        #[arg(long)]
        lsid0: u64,
        #[arg(long)]
        lsid1: u64,
    },
}

fn run(cmd: Command) -> Result<(), (&'static str, WalbError)> {
    match cmd {
        Command::FormatLdev {
            ldev,
            logical_bs,
            physical_bs,
            ldev_size_lb,
            ddev_size_lb,
            n_snapshots,
            name,
        } => format_ldev(
            &ldev,
            logical_bs,
            physical_bs,
            ldev_size_lb,
            ddev_size_lb,
            n_snapshots,
            &name,
        )
        .map_err(|e| ("format_ldev", e)),

        Command::CreateDev {
            ldev,
            ddev,
            max_logpack_kb,
        } => {
            let params = StartParams {
                max_logpack_kb,
                ..StartParams::default()
            };
            let ctl = WalbControl::create_dev(&ldev, &ddev, params).map_err(|e| ("create_dev", e))?;
            println!(
                "written_lsid={} oldest_lsid={}",
                ctl.get_written_lsid(),
                ctl.get_oldest_lsid()
            );
            Ok(())
        }

        Command::TakeCheckpoint { ldev, ddev } => {
            let ctl = WalbControl::create_dev(&ldev, &ddev, StartParams::default())
                .map_err(|e| ("take_checkpoint", e))?;
            ctl.take_checkpoint().map_err(|e| ("take_checkpoint", e))
        }

        Command::SubmitWrite {
            ldev,
            ddev,
            offset_lb,
            data_file,
        } => {
            let ctl = WalbControl::create_dev(&ldev, &ddev, StartParams::default())
                .map_err(|e| ("submit_write", e))?;
            let data = std::fs::read(&data_file).map_err(|e| ("submit_write", WalbError::from(e)))?;
            let lsid = ctl.submit_write(offset_lb, &data).map_err(|e| ("submit_write", e))?;
            ctl.take_checkpoint().map_err(|e| ("submit_write", e))?;
            println!("lsid={lsid}");
            Ok(())
        }

        Command::Status { ldev, ddev } => {
            let ctl = WalbControl::create_dev(&ldev, &ddev, StartParams::default())
                .map_err(|e| ("status", e))?;
            println!(
                "oldest_lsid={} written_lsid={} log_usage={} log_capacity={} flush_capable={} frozen={}",
                ctl.get_oldest_lsid(),
                ctl.get_written_lsid(),
                ctl.get_log_usage(),
                ctl.get_log_capacity(),
                ctl.is_flush_capable(),
                ctl.is_frozen(),
            );
            Ok(())
        }

        Command::SetOldestLsid { ldev, ddev, lsid } => {
            let ctl = WalbControl::create_dev(&ldev, &ddev, StartParams::default())
                .map_err(|e| ("set_oldest_lsid", e))?;
            ctl.set_oldest_lsid(lsid).map_err(|e| ("set_oldest_lsid", e))
        }

        Command::Resize {
            ldev,
            ddev,
            new_size_lb,
        } => {
            let ctl = WalbControl::create_dev(&ldev, &ddev, StartParams::default())
                .map_err(|e| ("resize", e))?;
            ctl.resize(new_size_lb).map_err(|e| ("resize", e))
        }

        Command::ResetWal { ldev, ddev } => {
            let ctl = WalbControl::create_dev(&ldev, &ddev, StartParams::default())
                .map_err(|e| ("reset_wal", e))?;
            ctl.reset_wal().map_err(|e| ("reset_wal", e))
        }

        Command::Freeze {
            ldev,
            ddev,
            timeout_sec,
        } => {
            let ctl = WalbControl::create_dev(&ldev, &ddev, StartParams::default())
                .map_err(|e| ("freeze", e))?;
            ctl.freeze(timeout_sec).map_err(|e| ("freeze", e))
        }

        Command::Melt { ldev, ddev } => {
            let ctl = WalbControl::create_dev(&ldev, &ddev, StartParams::default())
                .map_err(|e| ("melt", e))?;
            ctl.melt().map_err(|e| ("melt", e))
        }

        Command::SnapshotAdd {
            ldev,
            ddev,
            name,
            lsid,
            timestamp,
        } => {
            let ctl = WalbControl::create_dev(&ldev, &ddev, StartParams::default())
                .map_err(|e| ("snapshot_add", e))?;
            let id = ctl
                .snapshot_add(&name, lsid, timestamp)
                .map_err(|e| ("snapshot_add", e))?;
            ctl.take_checkpoint().map_err(|e| ("snapshot_add", e))?;
            println!("id={id}");
            Ok(())
        }

        Command::SnapshotDel { ldev, ddev, name } => {
            let ctl = WalbControl::create_dev(&ldev, &ddev, StartParams::default())
                .map_err(|e| ("snapshot_del", e))?;
            ctl.snapshot_del_by_name(&name).map_err(|e| ("snapshot_del", e))?;
            ctl.take_checkpoint().map_err(|e| ("snapshot_del", e))
        }

        Command::SnapshotDelRange {
            ldev,
            ddev,
            lsid0,
            lsid1,
        } => {
            let ctl = WalbControl::create_dev(&ldev, &ddev, StartParams::default())
                .map_err(|e| ("snapshot_del_range", e))?;
            let n = ctl
                .snapshot_del_range(lsid0, lsid1)
                .map_err(|e| ("snapshot_del_range", e))?;
            ctl.take_checkpoint().map_err(|e| ("snapshot_del_range", e))?;
            println!("deleted={n}");
            Ok(())
        }

        Command::SnapshotGet { ldev, ddev, name } => {
            let ctl = WalbControl::create_dev(&ldev, &ddev, StartParams::default())
                .map_err(|e| ("snapshot_get", e))?;
            let rec = ctl.snapshot_get_by_name(&name).map_err(|e| ("snapshot_get", e))?;
            println!("id={} name={} lsid={} timestamp={}", rec.snapshot_id, rec.name, rec.lsid, rec.timestamp);
            Ok(())
        }

        Command::SnapshotListRange {
            ldev,
            ddev,
            lsid0,
            lsid1,
        } => {
            let ctl = WalbControl::create_dev(&ldev, &ddev, StartParams::default())
                .map_err(|e| ("snapshot_list_range", e))?;
            let recs = ctl
                .snapshot_list_range(lsid0, lsid1)
                .map_err(|e| ("snapshot_list_range", e))?;
            for rec in recs {
                println!("id={} name={} lsid={} timestamp={}", rec.snapshot_id, rec.name, rec.lsid, rec.timestamp);
            }
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli.cmd) {
        Ok(()) => ExitCode::SUCCESS,
        Err((op, e)) => {
            eprintln!("walbctl: {op}: {}: {e}", e.kind());
            ExitCode::FAILURE
        }
    }
}
