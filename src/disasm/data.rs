use crate::disasm::error::DisassemblyError;
use crate::disasm::types::AddressRange;
use crate::parse::{ByteReader, ParsingError, SeekOrigin};

/// The merged data image: every data segment written at its decoded offset
/// into one dense buffer, with gaps zero-filled.
///
/// Scalars read out of the image combine bytes big-endian.
#[derive(Debug)]
pub struct DataImage {
	reader: ByteReader,
	ranges: Vec<AddressRange>,
}

impl DataImage {
	pub(crate) fn new(image: Vec<u8>, ranges: Vec<AddressRange>) -> Self {
		DataImage {
			reader: ByteReader::big_endian(image),
			ranges,
		}
	}

	pub fn len(&self) -> usize {
		self.reader.len()
	}

	pub fn is_empty(&self) -> bool {
		self.reader.is_empty()
	}

	pub fn ranges(&self) -> &[AddressRange] {
		&self.ranges
	}

	pub fn range_containing(&self, offset: u32) -> Option<AddressRange> {
		self.ranges.iter().find(|range| range.contains(offset)).copied()
	}

	pub(crate) fn read_at(&mut self, range: AddressRange) -> Result<Vec<u8>, DisassemblyError> {
		self.reader.seek(range.start as i64, SeekOrigin::Begin)?;
		Ok(self.reader.read_bytes((range.end - range.start) as usize)?)
	}

	/// Guesses what the bytes at `offset` are: an ANSI string, a wide string,
	/// or failing both, a hex-rendered integer suffixed with `h`.
	pub fn make_readable_data_info(&mut self, offset: u32) -> Result<String, DisassemblyError> {
		if let Some(text) = self.try_ansi_string(offset)? {
			return Ok(text);
		}
		if let Some(text) = self.try_wide_string(offset)? {
			return Ok(text);
		}
		self.hex_integer(offset)
	}

	/// Printable bytes up to a NUL terminator, or `None` if anything outside
	/// `[32, 126]` shows up first.
	fn try_ansi_string(&mut self, offset: u32) -> Result<Option<String>, DisassemblyError> {
		self.reader.seek(offset as i64, SeekOrigin::Begin)?;
		let mut text = String::new();
		loop {
			if self.reader.remaining() == 0 {
				return Ok(None);
			}
			match self.reader.read_u8()? {
				0 => break,
				byte @ 0x20..=0x7E => text.push(byte as char),
				_ => return Ok(None),
			}
		}
		Ok((!text.is_empty()).then(|| text))
	}

	/// The same guess over 16-bit units.
	fn try_wide_string(&mut self, offset: u32) -> Result<Option<String>, DisassemblyError> {
		self.reader.seek(offset as i64, SeekOrigin::Begin)?;
		let mut text = String::new();
		loop {
			if self.reader.remaining() < 2 {
				return Ok(None);
			}
			match self.reader.read_i16()? as u16 {
				0 => break,
				unit @ 0x20..=0x7E => text.push(unit as u8 as char),
				_ => return Ok(None),
			}
		}
		Ok((!text.is_empty()).then(|| text))
	}

	/// Up to four bytes rendered as a hex integer, e.g. `deadbeefh`.
	fn hex_integer(&mut self, offset: u32) -> Result<String, DisassemblyError> {
		self.reader.seek(offset as i64, SeekOrigin::Begin)?;
		let count = self.reader.remaining().min(4);
		if count == 0 {
			return Err(ParsingError::UnexpectedEndOfStream.into());
		}
		let mut value: u32 = 0;
		for _ in 0..count {
			value = (value << 8) | self.reader.read_u8()? as u32;
		}
		Ok(format!("{:x}h", value))
	}
}
