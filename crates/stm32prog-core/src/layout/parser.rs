//! Flash layout parser.
//!
//! A layout is a tab separated text file, one partition per line:
//!
//! ```text
//! #Opt  Id    Name     Type        IP     Offset
//! P     0x01  fsbl1    Binary      mmc1   boot1
//! P     0x03  ssbl     Binary      mmc1   0x00080000
//! PE    0x10  rootfs   FileSystem  mmc1   0x00280000
//! ```
//!
//! The text may itself be wrapped in an image header, in which case the
//! payload checksum is verified before anything is parsed.

use thiserror::Error;
use tracing::{debug, instrument};

use super::partition::{
    HwPartition, PartAddress, PartOptions, PartType, PartitionDescriptor, Target,
};
use crate::protocol::constants::PHASE_LAST_USER;
use crate::protocol::header::{BL_HEADER_SIZE, ChecksumMismatch, ImageHeader};

/// Size of the name buffer, terminator included.
pub const PART_NAME_SIZE: usize = 16;

/// Number of meaningful columns per line.
const COL_NB: usize = 6;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("Layout: {0}")]
    Checksum(#[from] ChecksumMismatch),
    #[error("Layout: empty FlashLayout")]
    Empty,
    #[error("Layout: too many partition ({0})")]
    TooManyPartitions(usize),
    #[error("Layout line {line}: invalid text encoding")]
    InvalidText { line: usize },
    #[error("Layout line {line}: invalid option '{option}' in {value})")]
    InvalidOption {
        line: usize,
        option: char,
        value: String,
    },
    #[error("Layout line {line}: missing 'P' in option {value}")]
    MissingSelect { line: usize, value: String },
    #[error("Layout line {line}: invalid phase value = {value}")]
    InvalidPhase { line: usize, value: String },
    #[error("Layout line {line}: partition name too long [{len}]: {name}")]
    NameTooLong {
        line: usize,
        len: usize,
        name: String,
    },
    #[error("Layout line {line}: type parsing error : '{value}'")]
    InvalidType { line: usize, value: String },
    #[error("Layout line {line}: ip parsing error: '{value}'")]
    InvalidIp { line: usize, value: String },
    #[error("Layout line {line}: invalid part '{value}'")]
    InvalidBootPartition { line: usize, value: String },
    #[error("Layout line {line}: invalid offset '{value}'")]
    InvalidOffset { line: usize, value: String },
    #[error("Layout line {line}: no enought column")]
    MissingColumns { line: usize },
    #[error("Layout: no partition found")]
    NoPartition,
}

/// Parse a layout region into descriptors, in file order.
#[instrument(level = "debug", skip(data), fields(size = data.len()))]
pub fn parse_flash_layout(data: &[u8]) -> Result<Vec<PartitionDescriptor>, LayoutError> {
    let text = match ImageHeader::detect(data) {
        Some(header) => {
            let payload = &data[BL_HEADER_SIZE..];
            header.verify_payload(payload)?;
            &payload[..header.image_length as usize]
        }
        None => data,
    };
    // The region is a C string: anything after a NUL is ignored.
    let text = match text.iter().position(|&b| b == 0) {
        Some(end) => &text[..end],
        None => text,
    };
    if text.is_empty() {
        return Err(LayoutError::Empty);
    }

    let expected = expected_partition_count(text);
    if expected > PHASE_LAST_USER as usize {
        return Err(LayoutError::TooManyPartitions(expected));
    }
    let mut parts = Vec::with_capacity(expected);

    for (index, raw_line) in text.split(|&b| b == b'\n').enumerate() {
        let line = index + 1;
        let columns = split_columns(raw_line, line)?;

        // blank line or multiple TAB only
        let Some(first) = columns.first() else {
            continue;
        };
        if first.starts_with('#') {
            continue;
        }

        let part = parse_line(line, &columns)?;
        debug!(
            line,
            id = %format!("0x{:02x}", part.id),
            name = %part.name,
            "Layout partition"
        );
        parts.push(part);
    }

    if parts.is_empty() {
        return Err(LayoutError::NoPartition);
    }
    Ok(parts)
}

/// Upper bound of partition lines: one per line not starting a comment.
fn expected_partition_count(text: &[u8]) -> usize {
    let mut count = 1;
    for (i, &b) in text.iter().enumerate() {
        if b == b'\n' && text.get(i + 1) != Some(&b'#') {
            count += 1;
        }
    }
    count
}

fn split_columns(raw_line: &[u8], line: usize) -> Result<Vec<String>, LayoutError> {
    raw_line
        .split(|&b| b == b'\t')
        .map(|col| {
            let col: Vec<u8> = col.iter().copied().filter(|&b| b != b'\r').collect();
            String::from_utf8(col).map_err(|_| LayoutError::InvalidText { line })
        })
        .filter(|col| !matches!(col, Ok(s) if s.is_empty()))
        .collect()
}

fn parse_line(line: usize, columns: &[String]) -> Result<PartitionDescriptor, LayoutError> {
    let mut part = PartitionDescriptor {
        option: PartOptions::none(),
        id: 0,
        name: String::new(),
        part_type: PartType::Binary,
        target: Target::None,
        address: PartAddress::Offset(0),
        line,
        size: 0,
        part_index: None,
        device: None,
        alt_id: None,
    };

    for (column, value) in columns.iter().take(COL_NB).enumerate() {
        match column {
            0 => part.option = parse_option(line, value)?,
            1 => part.id = parse_id(line, value)?,
            2 => part.name = parse_name(line, value)?,
            3 => part.part_type = parse_type(line, value)?,
            4 => part.target = parse_ip(line, value)?,
            _ => part.address = parse_offset(line, value)?,
        }
    }
    if columns.len() < COL_NB {
        return Err(LayoutError::MissingColumns { line });
    }
    Ok(part)
}

fn parse_option(line: usize, value: &str) -> Result<PartOptions, LayoutError> {
    let mut option = PartOptions::none();
    if value == "-" {
        return Ok(option);
    }
    for c in value.chars() {
        match c {
            'P' => option.insert(PartOptions::SELECT),
            'E' => option.insert(PartOptions::EMPTY),
            'D' => option.insert(PartOptions::DELETE),
            _ => {
                return Err(LayoutError::InvalidOption {
                    line,
                    option: c,
                    value: value.to_string(),
                });
            }
        }
    }
    if !option.is_select() {
        return Err(LayoutError::MissingSelect {
            line,
            value: value.to_string(),
        });
    }
    Ok(option)
}

fn parse_id(line: usize, value: &str) -> Result<u8, LayoutError> {
    match parse_c_integer(value) {
        Some(id) if id <= u64::from(PHASE_LAST_USER) => Ok(id as u8),
        _ => Err(LayoutError::InvalidPhase {
            line,
            value: value.to_string(),
        }),
    }
}

fn parse_name(line: usize, value: &str) -> Result<String, LayoutError> {
    if value.len() < PART_NAME_SIZE {
        Ok(value.to_string())
    } else {
        Err(LayoutError::NameTooLong {
            line,
            len: value.len(),
            name: value.to_string(),
        })
    }
}

fn parse_type(line: usize, value: &str) -> Result<PartType, LayoutError> {
    PartType::from_keyword(value).ok_or_else(|| LayoutError::InvalidType {
        line,
        value: value.to_string(),
    })
}

fn parse_ip(line: usize, value: &str) -> Result<Target, LayoutError> {
    if value == "none" {
        return Ok(Target::None);
    }
    // only one digit allowed for device id
    if let Some(digit) = value.strip_prefix("mmc")
        && let [d @ b'0'..=b'9'] = digit.as_bytes()
    {
        return Ok(Target::Mmc(d - b'0'));
    }
    Err(LayoutError::InvalidIp {
        line,
        value: value.to_string(),
    })
}

fn parse_offset(line: usize, value: &str) -> Result<PartAddress, LayoutError> {
    if let Some(index) = value.strip_prefix("boot") {
        return match index {
            "1" => Ok(PartAddress::Boot(HwPartition::Boot1)),
            "2" => Ok(PartAddress::Boot(HwPartition::Boot2)),
            _ => Err(LayoutError::InvalidBootPartition {
                line,
                value: value.to_string(),
            }),
        };
    }
    parse_address(value)
        .map(PartAddress::Offset)
        .ok_or_else(|| LayoutError::InvalidOffset {
            line,
            value: value.to_string(),
        })
}

/// `0x` prefixed hexadecimal, leading `0` octal, decimal otherwise.
pub(crate) fn parse_c_integer(value: &str) -> Option<u64> {
    if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        return parse_digits(hex, 16);
    }
    if value.len() > 1
        && let Some(octal) = value.strip_prefix('0')
    {
        return parse_digits(octal, 8);
    }
    parse_digits(value, 10)
}

/// `0x` prefixed hexadecimal, decimal otherwise.
pub(crate) fn parse_address(value: &str) -> Option<u64> {
    match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => parse_digits(hex, 16),
        None => parse_digits(value, 10),
    }
}

fn parse_digits(digits: &str, radix: u32) -> Option<u64> {
    // from_str_radix accepts a sign, the layout format does not
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    u64::from_str_radix(digits, radix).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: &str = "#Opt\tId\tName\tType\tIP\tOffset\n\
        P\t0x01\tfsbl1\tBinary\tmmc1\tboot1\n\
        P\t0x02\tfsbl2\tBinary\tmmc1\tboot2\n\
        \n\
        P\t0x03\tssbl\tBinary\tmmc1\t0x00080000\n\
        PE\t0x10\tbootfs\tSystem\tmmc1\t0x00280000\n\
        -\t0x11\tdata\tFileSystem\tnone\t0x0\n";

    #[test]
    fn test_single_partition() {
        let parts = parse_flash_layout(b"P\t0x10\tfsbl\tBinary\tmmc0\t0x4000\n").unwrap();
        assert_eq!(parts.len(), 1);
        let part = &parts[0];
        assert_eq!(part.id, 0x10);
        assert!(part.option.is_select());
        assert!(!part.option.is_empty());
        assert_eq!(part.part_type, PartType::Binary);
        assert_eq!(part.target, Target::Mmc(0));
        assert_eq!(part.address, PartAddress::Offset(0x4000));
    }

    #[test]
    fn test_full_layout() {
        let parts = parse_flash_layout(LAYOUT.as_bytes()).unwrap();
        let ids: Vec<u8> = parts.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![0x01, 0x02, 0x03, 0x10, 0x11]);
        assert_eq!(parts[0].address, PartAddress::Boot(HwPartition::Boot1));
        assert_eq!(parts[1].address, PartAddress::Boot(HwPartition::Boot2));
        assert_eq!(parts[2].address, PartAddress::Offset(0x80000));
        assert!(parts[3].option.is_empty());
        assert_eq!(parts[3].part_type, PartType::System);
        assert_eq!(parts[4].option, PartOptions::none());
        assert_eq!(parts[4].target, Target::None);
        assert_eq!(parts[4].line, 7);
    }

    #[test]
    fn test_crlf_and_multiple_tabs() {
        let text = "P\t\t0x01\tfsbl\t\tBinary\tmmc0\t0x4000\r\n\
                    \t#indented comment\r\n\
                    P\t0x02\tssbl\tBinary\tmmc0\t16384";
        let parts = parse_flash_layout(text.as_bytes()).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].name, "fsbl");
        assert_eq!(parts[0].address, PartAddress::Offset(0x4000));
        assert_eq!(parts[1].address, PartAddress::Offset(16384));
    }

    #[test]
    fn test_invalid_option() {
        let err = parse_flash_layout(b"#header\nX\t0x01\tfsbl\tBinary\tmmc0\t0x0\n").unwrap_err();
        assert_eq!(
            err,
            LayoutError::InvalidOption {
                line: 2,
                option: 'X',
                value: "X".to_string()
            }
        );
        assert!(err.to_string().contains("line 2"));
        assert!(err.to_string().contains("invalid option"));
    }

    #[test]
    fn test_missing_select() {
        let err = parse_flash_layout(b"E\t0x01\tfsbl\tBinary\tmmc0\t0x0\n").unwrap_err();
        assert!(matches!(err, LayoutError::MissingSelect { line: 1, .. }));
    }

    #[test]
    fn test_column_errors() {
        let cases: [(&str, fn(&LayoutError) -> bool); 7] = [
            ("P\t0xF1\tfsbl\tBinary\tmmc0\t0x0", |e| {
                matches!(e, LayoutError::InvalidPhase { .. })
            }),
            ("P\t1z\tfsbl\tBinary\tmmc0\t0x0", |e| {
                matches!(e, LayoutError::InvalidPhase { .. })
            }),
            ("P\t1\tname_is_16_bytes\tBinary\tmmc0\t0x0", |e| {
                matches!(e, LayoutError::NameTooLong { len: 16, .. })
            }),
            ("P\t1\tfsbl\tbinary\tmmc0\t0x0", |e| {
                matches!(e, LayoutError::InvalidType { .. })
            }),
            ("P\t1\tfsbl\tBinary\tmmc10\t0x0", |e| {
                matches!(e, LayoutError::InvalidIp { .. })
            }),
            ("P\t1\tfsbl\tBinary\tmmc0\tboot3", |e| {
                matches!(e, LayoutError::InvalidBootPartition { .. })
            }),
            ("P\t1\tfsbl\tBinary\tmmc0\t0x4000k", |e| {
                matches!(e, LayoutError::InvalidOffset { .. })
            }),
        ];
        for (line, check) in cases {
            let err = parse_flash_layout(line.as_bytes()).unwrap_err();
            assert!(check(&err), "{line:?} gave {err:?}");
        }
    }

    #[test]
    fn test_missing_columns() {
        let err = parse_flash_layout(b"P\t0x01\tfsbl\tBinary\tmmc0\n").unwrap_err();
        assert_eq!(err, LayoutError::MissingColumns { line: 1 });
    }

    #[test]
    fn test_no_partition() {
        let err = parse_flash_layout(b"#only a comment\n\n").unwrap_err();
        assert_eq!(err, LayoutError::NoPartition);
        assert_eq!(parse_flash_layout(b"").unwrap_err(), LayoutError::Empty);
    }

    #[test]
    fn test_nul_terminates_text() {
        let mut text = b"P\t0x01\tfsbl\tBinary\tmmc0\t0x0\n".to_vec();
        text.push(0);
        text.extend_from_slice(b"garbage\tthat\tis\tnot\tparsed");
        assert_eq!(parse_flash_layout(&text).unwrap().len(), 1);
    }

    #[test]
    fn test_header_wrapped_layout() {
        let text = b"P\t0x01\tfsbl\tBinary\tmmc0\t0x4000\n";
        let image = ImageHeader::wrap(text);
        let parts = parse_flash_layout(&image).unwrap();
        assert_eq!(parts.len(), 1);

        let mut corrupted = image.clone();
        let last = corrupted.len() - 2;
        corrupted[last] ^= 0x01;
        assert!(matches!(
            parse_flash_layout(&corrupted),
            Err(LayoutError::Checksum(_))
        ));
    }

    #[test]
    fn test_too_many_partitions() {
        let text: String = (0..241)
            .map(|i| format!("P\t{}\tp{}\tBinary\tmmc0\t0x0\n", i % 200 + 1, i))
            .collect();
        assert!(matches!(
            parse_flash_layout(text.as_bytes()),
            Err(LayoutError::TooManyPartitions(_))
        ));
    }

    #[test]
    fn test_integer_forms() {
        assert_eq!(parse_c_integer("0x1F"), Some(0x1F));
        assert_eq!(parse_c_integer("017"), Some(0o17));
        assert_eq!(parse_c_integer("0"), Some(0));
        assert_eq!(parse_c_integer("42"), Some(42));
        assert_eq!(parse_c_integer("-1"), None);
        assert_eq!(parse_address("0x00080000"), Some(0x80000));
        assert_eq!(parse_address("0080"), Some(80));
        assert_eq!(parse_address("0x"), None);
        assert_eq!(parse_address("+5"), None);
    }
}
