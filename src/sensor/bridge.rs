// ESP32 UART bridge
//
// The ESP32 classifies both color sensors itself and streams one line per
// sample: "<left> <right>", each 0 (white) or 1 (black). Lines that do not
// parse are dropped; a read timeout just means no data this cycle.

use std::io::{BufRead, BufReader, Read};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{LineReading, LineSource};
use crate::error::Result;

/// Read timeout per line; keeps the control loop responsive
pub const READ_TIMEOUT: Duration = Duration::from_millis(20);

/// Parse "<left> <right>"; nonzero means on line
pub fn parse_bridge_line(line: &str) -> Option<(LineReading, LineReading)> {
    let mut fields = line.split_whitespace();
    let left: i64 = fields.next()?.parse().ok()?;
    let right: i64 = fields.next()?.parse().ok()?;
    if fields.next().is_some() {
        return None;
    }
    let reading = |v: i64| {
        if v != 0 {
            LineReading::OnLine
        } else {
            LineReading::OffLine
        }
    };
    Some((reading(left), reading(right)))
}

/// Longest partial line kept while waiting for its newline
const MAX_LINE: usize = 64;

pub struct SerialLineBridge {
    reader: BufReader<Box<dyn Read + Send>>,
    // Bytes of a line whose newline has not arrived yet
    buffer: String,
}

impl SerialLineBridge {
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self> {
        info!("Opening line sensor bridge on {} @ {} baud", port_name, baud_rate);
        let port = serialport::new(port_name, baud_rate)
            .timeout(READ_TIMEOUT)
            .open()?;
        Ok(Self::from_reader(port))
    }

    pub fn from_reader(reader: impl Read + Send + 'static) -> Self {
        let reader: Box<dyn Read + Send> = Box::new(reader);
        Self {
            reader: BufReader::new(reader),
            buffer: String::new(),
        }
    }
}

impl LineSource for SerialLineBridge {
    fn read_line(&mut self) -> Option<(LineReading, LineReading)> {
        match self.reader.read_line(&mut self.buffer) {
            Ok(_) if self.buffer.ends_with('\n') => {
                let line = self.buffer.trim();
                let parsed = parse_bridge_line(line);
                if parsed.is_none() {
                    debug!("Ignoring bridge line {:?}", line);
                }
                self.buffer.clear();
                parsed
            }
            // End of stream or timeout mid-line: keep the partial line
            Ok(_) => None,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                if self.buffer.len() > MAX_LINE {
                    debug!("Dropping {} bytes without a newline", self.buffer.len());
                    self.buffer.clear();
                }
                None
            }
            Err(e) => {
                warn!("Bridge read failed: {}", e);
                self.buffer.clear();
                None
            }
        }
    }
}
