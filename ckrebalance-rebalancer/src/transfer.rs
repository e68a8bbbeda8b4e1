//! Partition file transfer between shard hosts
//!
//! Detached parts are copied with `rsync` run on the source host, pushing
//! over SSH to the destination. The source host must therefore be able to
//! reach the destination's SSH port without a password, as the account
//! rsync runs under (root when commands are escalated with sudo).
//!
//! Commands are sent through [`RemoteShell`], which may prefix every
//! `;`-separated sub-command with `sudo`. None of the commands built here
//! use `;`, and every path is single-quoted. Part directories are selected
//! by rsync filters and `find -name`, never by a shell glob: the login shell
//! expands globs before sudo runs and usually cannot read the data directory.

use ckrebalance_core::{CLICKHOUSE_OS_USER, DEFAULT_SSH_PORT, SUPERUSER};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::model::detached_dir;
use crate::planner::Move;
use crate::shell::{RemoteShell, ShellError};

/// Seconds the rsync transport waits for the destination's SSH port
const SSH_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Single-quote `value` for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Name pattern of every part directory of a partition
fn parts_pattern(partition_id: &str) -> String {
    format!("{}_*", partition_id)
}

/// Options for the rsync push
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// OS user the source connects to the destination as
    pub ssh_user: String,
    pub ssh_port: u16,
    /// Run rsync on the destination through sudo
    pub remote_sudo: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            ssh_user: SUPERUSER.to_string(),
            ssh_port: DEFAULT_SSH_PORT,
            remote_sudo: false,
        }
    }
}

/// `mkdir -p` the destination holding area
pub fn prepare_command(dst_detached: &str) -> String {
    format!("mkdir -p {}", shell_quote(dst_detached))
}

/// Push a partition's detached parts from the source to `destination`
pub fn rsync_command(
    options: &TransferOptions,
    src_detached: &str,
    partition_id: &str,
    destination: &str,
    dst_detached: &str,
) -> String {
    let rsync_path = if options.remote_sudo {
        r#" --rsync-path="sudo rsync""#
    } else {
        ""
    };
    format!(
        r#"rsync -e "ssh -o BatchMode=yes -o ConnectTimeout={} -o StrictHostKeyChecking=no -p {}" -avp{} --include={} --exclude='*' {}/ {}@{}:{}/"#,
        SSH_CONNECT_TIMEOUT_SECS,
        options.ssh_port,
        rsync_path,
        shell_quote(&format!("{}/***", parts_pattern(partition_id))),
        shell_quote(src_detached),
        options.ssh_user,
        destination,
        shell_quote(dst_detached)
    )
}

/// Hand the copied parts to the ClickHouse server account
pub fn chown_command(dst_detached: &str) -> String {
    format!(
        "chown -R {0}:{0} {1}",
        CLICKHOUSE_OS_USER,
        shell_quote(dst_detached)
    )
}

/// Remove the source's copy of the detached parts
pub fn cleanup_command(src_detached: &str, partition_id: &str) -> String {
    format!(
        "find {} -mindepth 1 -maxdepth 1 -name {} -exec rm -rf {{}} +",
        shell_quote(src_detached),
        shell_quote(&parts_pattern(partition_id))
    )
}

/// Copies detached partitions between hosts over a [`RemoteShell`]
#[derive(Clone)]
pub struct PartitionTransfer {
    shell: Arc<dyn RemoteShell>,
    options: TransferOptions,
}

impl PartitionTransfer {
    pub fn new(shell: Arc<dyn RemoteShell>, options: TransferOptions) -> Self {
        Self { shell, options }
    }

    /// Copy the detached parts of `mv` to the destination and fix ownership
    ///
    /// `src_path` and `dst_path` are the table directories on each host.
    #[instrument(skip(self, mv), fields(table = %mv.table, partition = %mv.partition_id))]
    pub async fn transfer(
        &self,
        mv: &Move,
        src_path: &str,
        dst_path: &str,
    ) -> Result<(), ShellError> {
        let src_detached = detached_dir(src_path);
        let dst_detached = detached_dir(dst_path);

        self.shell
            .run(&mv.destination, &prepare_command(&dst_detached))
            .await?;

        let rsync = rsync_command(
            &self.options,
            &src_detached,
            &mv.partition_id,
            &mv.destination,
            &dst_detached,
        );
        let output = self.shell.run(&mv.source, &rsync).await?;
        debug!(output = %output, "rsync finished");

        self.shell
            .run(&mv.destination, &chown_command(&dst_detached))
            .await?;

        info!(
            source = %mv.source,
            destination = %mv.destination,
            bytes = mv.bytes,
            "Partition files transferred"
        );
        Ok(())
    }

    /// Best-effort removal of the source's detached parts
    pub async fn cleanup(&self, mv: &Move, src_path: &str) -> bool {
        let cmd = cleanup_command(&detached_dir(src_path), &mv.partition_id);
        match self.shell.run(&mv.source, &cmd).await {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    host = %mv.source,
                    partition = %mv.partition_id,
                    error = %e,
                    "Failed to remove detached parts from source"
                );
                false
            }
        }
    }
}
