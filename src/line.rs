//! A reduced `.debug_line` reader.
//!
//! Only the parts of the line-number program that the rest of the engine
//! needs are modeled: the file-name table, for enumerating the source files
//! of a compilation unit, and the replayed `(address, line, end_sequence)`
//! rows, for bounding the address ranges of inlined functions whose entries
//! lack explicit range attributes. Column, statement and basic-block state
//! is decoded for stream correctness and then dropped.

use crate::buf::EndianBuf;
use crate::error::{Error, Result};

/// One entry of a line program's file-name table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    name: String,
    directory_index: u64,
}

impl FileEntry {
    /// The file name as stored, which may be absolute or relative.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Index into the include-directory table. Zero means the compilation
    /// directory.
    pub fn directory_index(&self) -> u64 {
        self.directory_index
    }
}

/// One row of the replayed line-number matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRow {
    /// The machine address of the row.
    pub address: u64,
    /// One-based index into the file-name table.
    pub file: u64,
    /// Source line, or 0 for compiler-generated code.
    pub line: u64,
    /// True for the row one past the end of a sequence. Its address is an
    /// exclusive bound, not a mapped instruction.
    pub end_sequence: bool,
}

/// A parsed line-number program for one compilation unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineProgram {
    include_directories: Vec<String>,
    files: Vec<FileEntry>,
    rows: Vec<LineRow>,
}

impl LineProgram {
    /// Parse and replay the line program at `offset` in `.debug_line`.
    pub fn parse(
        debug_line: EndianBuf<'_>,
        offset: usize,
        address_size: u8,
    ) -> Result<LineProgram> {
        let mut buf = debug_line.range_from(offset)?;

        let (initial, format) = buf.read_initial_length()?;
        let unit_length = usize::try_from(initial).map_err(|_| Error::CorruptUnitLength)?;
        let mut buf = buf.split(unit_length)?;

        let version = buf.read_u16()?;
        if !(2..=4).contains(&version) {
            return Err(Error::UnknownVersion(version));
        }

        let header_length = buf.read_offset(format)?;
        let mut header = buf.split(header_length)?;
        let mut program = buf;

        let minimum_instruction_length = header.read_u8()?;
        if minimum_instruction_length == 0 {
            return Err(Error::CorruptUnitLength);
        }
        if version >= 4 {
            // maximum_operations_per_instruction; VLIW op_index tracking is
            // not needed to bound addresses.
            let _ = header.read_u8()?;
        }
        let _default_is_stmt = header.read_u8()?;
        let line_base = header.read_i8()? as i64;
        let line_range = header.read_u8()?;
        if line_range == 0 {
            return Err(Error::CorruptUnitLength);
        }
        let opcode_base = header.read_u8()?;
        let mut standard_opcode_lengths = Vec::with_capacity(opcode_base.saturating_sub(1) as usize);
        for _ in 1..opcode_base {
            standard_opcode_lengths.push(header.read_u8()?);
        }

        let mut include_directories = Vec::new();
        loop {
            let dir = header.read_null_terminated()?;
            if dir.is_empty() {
                break;
            }
            include_directories.push(String::from_utf8_lossy(dir).into_owned());
        }

        let mut files = Vec::new();
        loop {
            let entry = match parse_file_entry(&mut header)? {
                Some(entry) => entry,
                None => break,
            };
            files.push(entry);
        }

        let mut rows = Vec::new();
        let mut registers = LineRow {
            address: 0,
            file: 1,
            line: 1,
            end_sequence: false,
        };

        while !program.is_empty() {
            let opcode = program.read_u8()?;
            if opcode >= opcode_base {
                // Special opcode: advances both address and line, emits a row.
                let adjusted = u64::from(opcode - opcode_base);
                registers.address = registers.address.saturating_add(
                    (adjusted / u64::from(line_range))
                        * u64::from(minimum_instruction_length),
                );
                registers.line = add_line(
                    registers.line,
                    line_base + (adjusted % u64::from(line_range)) as i64,
                );
                rows.push(registers);
            } else if opcode == 0 {
                // Extended opcode, length-prefixed.
                let len = program.read_uleb128()?;
                let len = usize::try_from(len).map_err(|_| Error::OffsetOutOfBounds)?;
                let mut args = program.split(len)?;
                let extended = args.read_u8()?;
                match extended {
                    DW_LNE_END_SEQUENCE => {
                        registers.end_sequence = true;
                        rows.push(registers);
                        registers = LineRow {
                            address: 0,
                            file: 1,
                            line: 1,
                            end_sequence: false,
                        };
                    }
                    DW_LNE_SET_ADDRESS => {
                        registers.address = args.read_address(address_size)?;
                    }
                    DW_LNE_DEFINE_FILE => {
                        if let Some(entry) = parse_file_entry(&mut args)? {
                            files.push(entry);
                        }
                    }
                    _ => {
                        // Vendor extensions: the length prefix already told
                        // us how much to ignore.
                    }
                }
            } else {
                match opcode {
                    DW_LNS_COPY => rows.push(registers),
                    DW_LNS_ADVANCE_PC => {
                        // Saturate rather than wrap: a corrupt operand must
                        // not panic, and a clamped address still orders rows.
                        let units = program
                            .read_uleb128()?
                            .saturating_mul(u64::from(minimum_instruction_length));
                        registers.address = registers.address.saturating_add(units);
                    }
                    DW_LNS_ADVANCE_LINE => {
                        let delta = program.read_sleb128()?;
                        registers.line = add_line(registers.line, delta);
                    }
                    DW_LNS_SET_FILE => registers.file = program.read_uleb128()?,
                    DW_LNS_CONST_ADD_PC => {
                        let adjusted = u64::from(255 - opcode_base);
                        registers.address = registers.address.saturating_add(
                            (adjusted / u64::from(line_range))
                                * u64::from(minimum_instruction_length),
                        );
                    }
                    DW_LNS_FIXED_ADVANCE_PC => {
                        registers.address =
                            registers.address.saturating_add(u64::from(program.read_u16()?));
                    }
                    _ => {
                        // Skip the operands of standard opcodes we do not
                        // track, using the header's declared arity.
                        let count = standard_opcode_lengths
                            .get(opcode as usize - 1)
                            .copied()
                            .unwrap_or(0);
                        for _ in 0..count {
                            program.read_uleb128()?;
                        }
                    }
                }
            }
        }

        Ok(LineProgram {
            include_directories,
            files,
            rows,
        })
    }

    /// The include-directory table, excluding the implicit compilation
    /// directory at index zero.
    pub fn include_directories(&self) -> &[String] {
        &self.include_directories
    }

    /// The file-name table. Indices in [`LineRow::file`] are one-based.
    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    /// The replayed rows, in program order.
    pub fn rows(&self) -> &[LineRow] {
        &self.rows
    }

    /// Compose the full path of file `index`, joining relative names with
    /// their include directory and falling back to `comp_dir`.
    pub fn file_path(&self, index: u64, comp_dir: Option<&str>) -> Option<String> {
        let entry = self.files.get(usize::checked_sub(index as usize, 1)?)?;
        if entry.name.starts_with('/') {
            return Some(entry.name.clone());
        }
        let directory = if entry.directory_index == 0 {
            comp_dir
        } else {
            self.include_directories
                .get(entry.directory_index as usize - 1)
                .map(|dir| dir.as_str())
        };
        match directory {
            Some(dir) if !dir.is_empty() => Some(format!("{}/{}", dir, entry.name)),
            _ => Some(entry.name.clone()),
        }
    }

    /// Tightest address range of mapped rows within `[low, high)`, for
    /// repairing inlined functions whose own range attributes are absent.
    /// End-sequence rows bound but are never themselves included.
    pub fn bounds_within(&self, low: u64, high: u64) -> Option<(u64, u64)> {
        let mut result: Option<(u64, u64)> = None;
        for window in self.rows.windows(2) {
            let row = window[0];
            if row.end_sequence || row.address < low || row.address >= high {
                continue;
            }
            let end = window[1].address.min(high);
            result = Some(match result {
                Some((min, max)) => (min.min(row.address), max.max(end)),
                None => (row.address, end),
            });
        }
        result
    }
}

fn parse_file_entry(buf: &mut EndianBuf<'_>) -> Result<Option<FileEntry>> {
    let name = buf.read_null_terminated()?;
    if name.is_empty() {
        return Ok(None);
    }
    let directory_index = buf.read_uleb128()?;
    let _mtime = buf.read_uleb128()?;
    let _length = buf.read_uleb128()?;
    Ok(Some(FileEntry {
        name: String::from_utf8_lossy(name).into_owned(),
        directory_index,
    }))
}

fn add_line(line: u64, delta: i64) -> u64 {
    if delta < 0 {
        line.saturating_sub(delta.unsigned_abs())
    } else {
        line.saturating_add(delta as u64)
    }
}

const DW_LNS_COPY: u8 = 0x01;
const DW_LNS_ADVANCE_PC: u8 = 0x02;
const DW_LNS_ADVANCE_LINE: u8 = 0x03;
const DW_LNS_SET_FILE: u8 = 0x04;
const DW_LNS_CONST_ADD_PC: u8 = 0x08;
const DW_LNS_FIXED_ADVANCE_PC: u8 = 0x09;

const DW_LNE_END_SEQUENCE: u8 = 0x01;
const DW_LNE_SET_ADDRESS: u8 = 0x02;
const DW_LNE_DEFINE_FILE: u8 = 0x03;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::Format;
    use crate::endian::RunTimeEndian;
    use crate::test_util::SectionMethods;
    use test_assembler::{Endian, Label, LabelMaker, Section};

    fn assemble() -> Vec<u8> {
        let start = Label::new();
        let end = Label::new();
        let header_start = Label::new();
        let header_end = Label::new();
        let length = Label::new();
        let header_length = Label::new();

        let section = Section::with_endian(Endian::Little)
            .initial_length(Format::Dwarf32, &length, &start)
            .D16(4) // version
            .D32(&header_length)
            .mark(&header_start)
            .D8(1) // minimum_instruction_length
            .D8(1) // maximum_operations_per_instruction
            .D8(1) // default_is_stmt
            .D8(-5i8 as u8) // line_base
            .D8(14) // line_range
            .D8(13) // opcode_base
            .append_bytes(&[0, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1]) // arities
            .append_bytes(b"include\0") // include directory 1
            .D8(0)
            .append_bytes(b"main.c\0")
            .uleb(0)
            .uleb(0)
            .uleb(0)
            .append_bytes(b"util.h\0")
            .uleb(1)
            .uleb(0)
            .uleb(0)
            .D8(0)
            .mark(&header_end)
            // DW_LNE_set_address 0x1000
            .D8(0)
            .uleb(5)
            .D8(DW_LNE_SET_ADDRESS)
            .D32(0x1000)
            // special opcode: advance address by 2, line by 3 -> row
            // opcode = (2 * 14) + (3 - (-5)) + 13 = 49
            .D8(49)
            // DW_LNS_set_file 2
            .D8(DW_LNS_SET_FILE)
            .uleb(2)
            // DW_LNS_advance_pc 4, DW_LNS_copy
            .D8(DW_LNS_ADVANCE_PC)
            .uleb(4)
            .D8(DW_LNS_COPY)
            // DW_LNS_advance_pc 2, DW_LNE_end_sequence
            .D8(DW_LNS_ADVANCE_PC)
            .uleb(2)
            .D8(0)
            .uleb(1)
            .D8(DW_LNE_END_SEQUENCE)
            .mark(&end);

        length.set_const((&end - &start) as u64);
        header_length.set_const((&header_end - &header_start) as u64);
        section.get_contents().unwrap()
    }

    #[test]
    fn test_parse_line_program() {
        let bytes = assemble();
        let debug_line = EndianBuf::new(&bytes, RunTimeEndian::Little);
        let program = LineProgram::parse(debug_line, 0, 4).unwrap();

        assert_eq!(program.include_directories(), &["include".to_string()]);
        assert_eq!(program.files().len(), 2);
        assert_eq!(program.files()[0].name(), "main.c");
        assert_eq!(program.files()[1].name(), "util.h");

        assert_eq!(
            program.rows(),
            &[
                LineRow {
                    address: 0x1002,
                    file: 1,
                    line: 4,
                    end_sequence: false
                },
                LineRow {
                    address: 0x1006,
                    file: 2,
                    line: 4,
                    end_sequence: false
                },
                LineRow {
                    address: 0x1008,
                    file: 2,
                    line: 4,
                    end_sequence: true
                },
            ]
        );
    }

    #[test]
    fn test_file_paths() {
        let bytes = assemble();
        let debug_line = EndianBuf::new(&bytes, RunTimeEndian::Little);
        let program = LineProgram::parse(debug_line, 0, 4).unwrap();

        assert_eq!(
            program.file_path(1, Some("/src")),
            Some("/src/main.c".to_string())
        );
        assert_eq!(
            program.file_path(2, Some("/src")),
            Some("include/util.h".to_string())
        );
        assert_eq!(program.file_path(3, None), None);
    }

    #[test]
    fn test_bounds_within() {
        let bytes = assemble();
        let debug_line = EndianBuf::new(&bytes, RunTimeEndian::Little);
        let program = LineProgram::parse(debug_line, 0, 4).unwrap();

        assert_eq!(program.bounds_within(0x1000, 0x2000), Some((0x1002, 0x1008)));
        assert_eq!(program.bounds_within(0x1003, 0x1007), Some((0x1006, 0x1007)));
        assert_eq!(program.bounds_within(0x2000, 0x3000), None);
    }

    #[test]
    fn test_hostile_advance_saturates() {
        let start = Label::new();
        let end = Label::new();
        let header_start = Label::new();
        let header_end = Label::new();
        let length = Label::new();
        let header_length = Label::new();

        let section = Section::with_endian(Endian::Little)
            .initial_length(Format::Dwarf32, &length, &start)
            .D16(4) // version
            .D32(&header_length)
            .mark(&header_start)
            .D8(4) // minimum_instruction_length
            .D8(1) // maximum_operations_per_instruction
            .D8(1) // default_is_stmt
            .D8(-5i8 as u8) // line_base
            .D8(14) // line_range
            .D8(13) // opcode_base
            .append_bytes(&[0, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1]) // arities
            .D8(0) // no include directories
            .D8(0) // no file entries
            .mark(&header_end)
            // An advance whose product cannot fit in an address.
            .D8(DW_LNS_ADVANCE_PC)
            .uleb(u64::MAX)
            // Pile up line deltas past the top of the counter.
            .D8(DW_LNS_ADVANCE_LINE)
            .sleb(i64::MAX)
            .D8(DW_LNS_ADVANCE_LINE)
            .sleb(i64::MAX)
            .D8(DW_LNS_ADVANCE_LINE)
            .sleb(1)
            .D8(DW_LNS_COPY)
            .D8(DW_LNS_FIXED_ADVANCE_PC)
            .D16(0xffff)
            .D8(DW_LNS_COPY)
            .mark(&end);

        length.set_const((&end - &start) as u64);
        header_length.set_const((&header_end - &header_start) as u64);
        let bytes = section.get_contents().unwrap();

        let debug_line = EndianBuf::new(&bytes, RunTimeEndian::Little);
        let program = LineProgram::parse(debug_line, 0, 4).unwrap();
        assert_eq!(program.rows()[0].address, u64::MAX);
        assert_eq!(program.rows()[0].line, u64::MAX);
        assert_eq!(program.rows()[1].address, u64::MAX);
    }

    #[test]
    fn test_bad_version() {
        let section = Section::with_endian(Endian::Little).D32(2).D16(9);
        let bytes = section.get_contents().unwrap();
        let debug_line = EndianBuf::new(&bytes, RunTimeEndian::Little);
        assert_eq!(
            LineProgram::parse(debug_line, 0, 4),
            Err(Error::UnknownVersion(9))
        );
    }
}
