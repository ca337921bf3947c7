use std::collections::HashMap;
use std::time::Duration;

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use wormhole_core::{ConnectionId, ReceiveProgress, SendProgress, TransferProgress};

/// One spinner per connection carrying a transfer.
///
/// The archive size is not known up front, so bars show bytes and throughput only.
pub struct TransferView {
    multi: MultiProgress,
    bars: HashMap<ConnectionId, ProgressBar>,
}

impl TransferView {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    /// Print a line without tearing any running spinner.
    pub fn println(&self, line: impl AsRef<str>) {
        self.multi.suspend(|| println!("{}", line.as_ref()));
    }

    pub fn update(&mut self, conn: ConnectionId, progress: &TransferProgress) {
        match progress {
            TransferProgress::Send(p) => self.update_send(conn, p),
            TransferProgress::Receive(p) => self.update_receive(conn, p),
        }
    }

    fn update_send(&mut self, conn: ConnectionId, progress: &SendProgress) {
        match progress {
            SendProgress::AwaitingHandshake => {
                self.bar(conn, "send").set_message("waiting for receiver");
            }
            SendProgress::Resuming { offset } if *offset > 0 => {
                let bar = self.bar(conn, "send");
                bar.set_message(format!("resuming at {}", format_bytes(*offset)));
            }
            SendProgress::Resuming { .. } => {
                self.bar(conn, "send").set_message("sending");
            }
            SendProgress::Sending { bytes_sent, .. } => {
                self.bar(conn, "send").set_position(*bytes_sent);
            }
            SendProgress::Finished { bytes_sent } => self.finish(
                conn,
                format!(
                    "{} sent {}",
                    style("✓").green().bold(),
                    format_bytes(*bytes_sent)
                ),
            ),
            SendProgress::Closed => self.abandon(
                conn,
                format!("{} receiver disconnected", style("⚠").yellow()),
            ),
            SendProgress::Cancelled => self.clear(conn),
            SendProgress::Error(e) => {
                self.abandon(conn, format!("{} {}", style("✗").red(), e));
            }
        }
    }

    fn update_receive(&mut self, conn: ConnectionId, progress: &ReceiveProgress) {
        match progress {
            ReceiveProgress::HandshakeSent { received_bytes } if *received_bytes > 0 => {
                let bar = self.bar(conn, "recv");
                bar.set_position(*received_bytes);
                bar.set_message(format!("resuming at {}", format_bytes(*received_bytes)));
            }
            ReceiveProgress::HandshakeSent { .. } => {
                self.bar(conn, "recv").set_message("waiting for sender");
            }
            ReceiveProgress::Receiving { total_received, .. } => {
                let bar = self.bar(conn, "recv");
                bar.set_position(*total_received);
                bar.set_message("receiving");
            }
            ReceiveProgress::Extracting => {
                self.bar(conn, "recv").set_message("extracting");
            }
            ReceiveProgress::Finished { dest, entries } => self.finish(
                conn,
                format!(
                    "{} {} entries saved to {}",
                    style("✓").green().bold(),
                    entries,
                    style(dest.display()).cyan()
                ),
            ),
            ReceiveProgress::Cancelled => self.clear(conn),
            ReceiveProgress::Error(e) => self.abandon(
                conn,
                format!("{} {} (partial file kept)", style("✗").red(), e),
            ),
        }
    }

    fn bar(&mut self, conn: ConnectionId, verb: &str) -> &ProgressBar {
        self.bars.entry(conn).or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new_spinner());
            bar.set_style(spinner_style());
            bar.set_prefix(format!("{verb} {conn}"));
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        })
    }

    fn finish(&mut self, conn: ConnectionId, message: String) {
        match self.bars.remove(&conn) {
            Some(bar) => bar.finish_with_message(message),
            None => self.println(message),
        }
    }

    /// Drop the spinner of a session that never got going.
    fn clear(&mut self, conn: ConnectionId) {
        if let Some(bar) = self.bars.remove(&conn) {
            bar.finish_and_clear();
        }
    }

    fn abandon(&mut self, conn: ConnectionId, message: String) {
        match self.bars.remove(&conn) {
            Some(bar) => bar.abandon_with_message(message),
            None => self.println(message),
        }
    }
}

impl Default for TransferView {
    fn default() -> Self {
        Self::new()
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{spinner:.green} {prefix:.bold} {bytes} ({binary_bytes_per_sec}) {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(12), "12 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }
}
