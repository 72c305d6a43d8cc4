use super::error::BufferError;
use super::queue::TaskQueue;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    pub tasks: usize,
    pub items: usize,
}

impl std::ops::AddAssign for ExportSummary {
    fn add_assign(&mut self, other: Self) {
        self.tasks += other.tasks;
        self.items += other.items;
    }
}

/// Writes the items of every pending task as plaintext, one item per line.
/// Without `retain`, each task is removed once its items are written.
pub async fn export_queue<W>(
    queue: &TaskQueue,
    sink: &mut W,
    retain: bool,
) -> Result<ExportSummary, BufferError>
where
    W: AsyncWrite + Unpin,
{
    let mut summary = ExportSummary::default();
    for (handle, task) in queue.iterate().await? {
        for item in task.items() {
            sink.write_all(item.as_bytes())
                .await
                .map_err(BufferError::Export)?;
            sink.write_all(b"\n").await.map_err(BufferError::Export)?;
        }
        summary.tasks += 1;
        summary.items += task.len();

        if !retain {
            queue.remove(handle).await?;
        }
    }
    sink.flush().await.map_err(BufferError::Export)?;
    Ok(summary)
}
