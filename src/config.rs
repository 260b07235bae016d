//! Collection configuration.
//!
//! The configuration file is XML with a `collection` root element
//! carrying the station identity, one serial `CONNECTION`, the `PAKBUS`
//! addressing block and a `DATA` block naming the tables to collect:
//!
//! ```xml
//! <collection logger="CR1000" station_name="tower1">
//!   <CONNECTION type="serial">
//!     <port_name>/dev/ttyS0</port_name>
//!     <baud_rate>9600</baud_rate>
//!     <vtime>10</vtime>
//!   </CONNECTION>
//!   <PAKBUS>
//!     <dst_pakbus_id>1</dst_pakbus_id>
//!     <dst_node_pakbus_id>1</dst_node_pakbus_id>
//!     <security_code>0</security_code>
//!   </PAKBUS>
//!   <DATA>
//!     <working_path>/data/tower1</working_path>
//!     <collect_table>
//!       <table sample_int_secs="600" file_span_secs="3600">TenMin</table>
//!     </collect_table>
//!   </DATA>
//! </collection>
//! ```
//!
//! Element matching is case-insensitive. A `-p /dev/ttyUSB0,19200`
//! command-line override replaces the configured port (and, after the
//! comma, the baud rate).

use std::fs;
use std::path::{Path, PathBuf};

use roxmltree::{Document, Node};
use tracing::debug;

use crate::message::PakBusAddress;
use crate::transport::DEFAULT_VTIME;
use crate::types::{StationInfo, TableOptions};
use crate::{PakBusError, Result};

/// Serial connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    /// Serial device path, e.g. `/dev/ttyS0`.
    pub port_name: String,
    /// Baud rate; unsupported rates fall back to 9600 at open time.
    pub baud_rate: u32,
    /// Read timeout in tenths of a second.
    pub vtime: u32,
}

/// The complete collection configuration.
#[derive(Debug, Clone)]
pub struct CollectionConfig {
    /// Station identity used in data file headers.
    pub station: StationInfo,
    /// Serial link settings.
    pub serial: SerialSettings,
    /// PakBus address of the logger.
    pub pakbus: PakBusAddress,
    /// Directory holding data files and the `.working` state directory.
    pub working_path: PathBuf,
    /// Tables to collect, in order.
    pub tables: Vec<TableOptions>,
    /// Whether the config file requested debug logging.
    pub debug: bool,
}

impl CollectionConfig {
    /// Load and validate the configuration file.
    pub fn load(path: &Path) -> Result<CollectionConfig> {
        debug!("Parsing config file: {}", path.display());
        let text = fs::read_to_string(path).map_err(|e| PakBusError::io(path, e))?;
        CollectionConfig::parse(&text)
    }

    /// Parse a configuration document.
    pub fn parse(text: &str) -> Result<CollectionConfig> {
        let doc = Document::parse(text)
            .map_err(|e| PakBusError::config(format!("XML file isn't well-formed: {e}")))?;

        let root = doc.root_element();
        if !root.tag_name().name().eq_ignore_ascii_case("collection") {
            return Err(PakBusError::config("no 'collection' root element in XML file"));
        }

        let station = StationInfo {
            logger_type: root.attribute("logger").unwrap_or("N/A").to_string(),
            station_name: root.attribute("station_name").unwrap_or("N/A").to_string(),
        };

        let mut serial = None;
        let mut pakbus = None;
        let mut data: Option<(PathBuf, Vec<TableOptions>)> = None;
        let mut debug_flag = false;

        for node in root.children().filter(Node::is_element) {
            let name = node.tag_name().name();
            if name.eq_ignore_ascii_case("CONNECTION") {
                let conn_type = node.attribute("type").unwrap_or("");
                if conn_type.eq_ignore_ascii_case("serial") {
                    serial = Some(parse_serial(&node)?);
                }
            } else if name.eq_ignore_ascii_case("PAKBUS") {
                pakbus = Some(parse_pakbus(&node)?);
            } else if name.eq_ignore_ascii_case("DATA") {
                data = Some(parse_data(&node)?);
            } else if name.eq_ignore_ascii_case("DEBUG") {
                debug_flag = node_text(&node).contains("TRUE");
            }
        }

        let serial = serial
            .ok_or_else(|| PakBusError::config("missing input parameter: CONNECTION"))?;
        let pakbus =
            pakbus.ok_or_else(|| PakBusError::config("missing input parameter: PAKBUS"))?;
        let (working_path, tables) =
            data.ok_or_else(|| PakBusError::config("missing input parameter: DATA"))?;

        Ok(CollectionConfig { station, serial, pakbus, working_path, tables, debug: debug_flag })
    }

    /// Apply a `-p` connection override of the form
    /// `/dev/tty...[,baud]`.
    pub fn apply_connection_string(&mut self, conn: &str) -> Result<()> {
        if !conn.contains("tty") {
            return Err(PakBusError::config(format!(
                "connection string '{conn}' is not a serial device"
            )));
        }
        match conn.split_once(',') {
            Some((port, baud)) => {
                self.serial.port_name = port.to_string();
                let baud: u32 = baud.trim().parse().map_err(|_| {
                    PakBusError::config(format!("invalid baud rate in connection string '{conn}'"))
                })?;
                if baud > 0 {
                    self.serial.baud_rate = baud;
                }
            }
            None => self.serial.port_name = conn.to_string(),
        }
        Ok(())
    }

    /// Override the working path from the command line.
    pub fn set_working_path(&mut self, path: impl Into<PathBuf>) {
        self.working_path = path.into();
    }
}

fn node_text(node: &Node<'_, '_>) -> String {
    node.text().unwrap_or("").trim().to_string()
}

fn child_text<'a>(node: &'a Node<'_, '_>, name: &str) -> Option<String> {
    node.children()
        .filter(Node::is_element)
        .find(|n| n.tag_name().name().eq_ignore_ascii_case(name))
        .map(|n| node_text(&n))
}

fn parse_serial(node: &Node<'_, '_>) -> Result<SerialSettings> {
    let port_name = child_text(node, "port_name").unwrap_or_else(|| "Unknown".to_string());
    let baud_rate: u32 = child_text(node, "baud_rate")
        .and_then(|t| t.parse().ok())
        .filter(|&b| b > 0)
        .ok_or_else(|| {
            PakBusError::config("incomplete input for establishing serial connection: baud_rate")
        })?;
    let vtime = child_text(node, "vtime")
        .and_then(|t| t.parse().ok())
        .unwrap_or(DEFAULT_VTIME);
    Ok(SerialSettings { port_name, baud_rate, vtime })
}

fn parse_pakbus(node: &Node<'_, '_>) -> Result<PakBusAddress> {
    let field = |name: &str| -> Result<u32> {
        child_text(node, name)
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| {
                PakBusError::config(format!("incomplete PakBus configuration: {name}"))
            })
    };

    let phys_addr = field("dst_pakbus_id")?;
    let node_id = field("dst_node_pakbus_id")?;
    let security_code = field("security_code")?;

    for (name, value) in [("dst_pakbus_id", phys_addr), ("dst_node_pakbus_id", node_id)] {
        if !(1..=4094).contains(&value) {
            return Err(PakBusError::config(format!("{name} must be within 1..4094, got {value}")));
        }
    }
    if security_code > u32::from(u16::MAX) {
        return Err(PakBusError::config("security_code does not fit in 16 bits"));
    }

    Ok(PakBusAddress {
        phys_addr: phys_addr as u16,
        node_id: node_id as u16,
        security_code: security_code as u16,
    })
}

fn parse_data(node: &Node<'_, '_>) -> Result<(PathBuf, Vec<TableOptions>)> {
    let working_path = child_text(node, "working_path")
        .ok_or_else(|| PakBusError::config("missing input parameter: working_path"))?;

    let mut tables = Vec::new();
    for collect in node
        .children()
        .filter(Node::is_element)
        .filter(|n| n.tag_name().name().eq_ignore_ascii_case("collect_table"))
    {
        for tnode in collect
            .children()
            .filter(Node::is_element)
            .filter(|n| n.tag_name().name().eq_ignore_ascii_case("table"))
        {
            let name = node_text(&tnode);
            if name.is_empty() {
                continue;
            }
            let sample_int_secs = tnode
                .attribute("sample_int_secs")
                .and_then(|v| v.parse().ok())
                .unwrap_or(-1);
            let file_span_secs = tnode
                .attribute("file_span_secs")
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|&v| v > 0)
                .map(|v| v as u32)
                .unwrap_or(3600);
            tables.push(TableOptions { name, file_span_secs, sample_int_secs });
        }
    }

    if tables.is_empty() {
        return Err(PakBusError::config("incomplete input for data table names"));
    }
    Ok((PathBuf::from(working_path), tables))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"<collection logger="CR1000" station_name="tower1">
  <CONNECTION type="serial">
    <port_name> /dev/ttyS0 </port_name>
    <baud_rate>19200</baud_rate>
    <vtime>20</vtime>
  </CONNECTION>
  <PAKBUS>
    <dst_pakbus_id>2674</dst_pakbus_id>
    <dst_node_pakbus_id>2674</dst_node_pakbus_id>
    <security_code>0</security_code>
  </PAKBUS>
  <DATA>
    <working_path>/data/tower1</working_path>
    <collect_table>
      <table sample_int_secs="600" file_span_secs="7200">TenMin</table>
      <table>Status</table>
    </collect_table>
  </DATA>
  <DEBUG>TRUE</DEBUG>
</collection>"#;

    #[test]
    fn full_config_parses() {
        let cfg = CollectionConfig::parse(FULL).unwrap();
        assert_eq!(cfg.station.logger_type, "CR1000");
        assert_eq!(cfg.station.station_name, "tower1");
        assert_eq!(cfg.serial.port_name, "/dev/ttyS0");
        assert_eq!(cfg.serial.baud_rate, 19200);
        assert_eq!(cfg.serial.vtime, 20);
        assert_eq!(cfg.pakbus.phys_addr, 2674);
        assert_eq!(cfg.pakbus.security_code, 0);
        assert_eq!(cfg.working_path, PathBuf::from("/data/tower1"));
        assert!(cfg.debug);

        assert_eq!(cfg.tables.len(), 2);
        assert_eq!(cfg.tables[0].name, "TenMin");
        assert_eq!(cfg.tables[0].sample_int_secs, 600);
        assert_eq!(cfg.tables[0].file_span_secs, 7200);
        // Defaults apply where attributes are absent
        assert_eq!(cfg.tables[1].name, "Status");
        assert_eq!(cfg.tables[1].sample_int_secs, -1);
        assert_eq!(cfg.tables[1].file_span_secs, 3600);
    }

    #[test]
    fn vtime_defaults_when_absent() {
        let text = FULL.replace("<vtime>20</vtime>", "");
        let cfg = CollectionConfig::parse(&text).unwrap();
        assert_eq!(cfg.serial.vtime, DEFAULT_VTIME);
    }

    fn without_block(start: &str, end: &str) -> String {
        let beg = FULL.find(start).unwrap();
        let fin = FULL.find(end).unwrap() + end.len();
        format!("{}{}", &FULL[..beg], &FULL[fin..])
    }

    #[test]
    fn missing_blocks_are_reported() {
        for (start, end, expect) in [
            ("<PAKBUS>", "</PAKBUS>", "PAKBUS"),
            ("<CONNECTION", "</CONNECTION>", "CONNECTION"),
            ("<DATA>", "</DATA>", "DATA"),
        ] {
            match CollectionConfig::parse(&without_block(start, end)) {
                Err(PakBusError::Config { details }) => {
                    assert!(details.contains(expect), "details: {details}");
                }
                other => panic!("Expected config error for {expect}, got {other:?}"),
            }
        }
    }

    #[test]
    fn missing_baud_rate_is_an_error() {
        let text = FULL.replace("<baud_rate>19200</baud_rate>", "");
        assert!(CollectionConfig::parse(&text).is_err());
    }

    #[test]
    fn pakbus_id_range_is_validated() {
        let text = FULL.replace("<dst_pakbus_id>2674</dst_pakbus_id>", "<dst_pakbus_id>5000</dst_pakbus_id>");
        assert!(CollectionConfig::parse(&text).is_err());
        let text = FULL.replace("<dst_pakbus_id>2674</dst_pakbus_id>", "<dst_pakbus_id>0</dst_pakbus_id>");
        assert!(CollectionConfig::parse(&text).is_err());
    }

    #[test]
    fn connection_override_with_baud() {
        let mut cfg = CollectionConfig::parse(FULL).unwrap();
        cfg.apply_connection_string("/dev/ttyUSB1,57600").unwrap();
        assert_eq!(cfg.serial.port_name, "/dev/ttyUSB1");
        assert_eq!(cfg.serial.baud_rate, 57600);

        cfg.apply_connection_string("/dev/ttyUSB2").unwrap();
        assert_eq!(cfg.serial.port_name, "/dev/ttyUSB2");
        assert_eq!(cfg.serial.baud_rate, 57600);

        assert!(cfg.apply_connection_string("192.168.1.1:6785").is_err());
    }

    #[test]
    fn malformed_xml_is_a_config_error() {
        assert!(matches!(
            CollectionConfig::parse("<collection><unclosed></collection>"),
            Err(PakBusError::Config { .. })
        ));
    }

    #[test]
    fn wrong_root_element_is_rejected() {
        assert!(CollectionConfig::parse("<other/>").is_err());
    }
}
