//! Drives the public API end to end over assembled sections: stop at a
//! breakpoint, identify the function, locate a parameter through its
//! frame base, and unwind a register through the call-frame info.

use moria::{
    DebugInfoProvider, Error, EvalContext, NoProgress, Result, RunTimeEndian, SectionId,
    SymbolFile, VariableLocation,
};
use test_assembler::{Endian, Label, LabelMaker, Section};

// All abbreviation codes, attribute names and forms in this program are
// below 0x80, so a single byte is a valid ULEB128 for each.
fn debug_abbrev() -> Vec<u8> {
    #[rustfmt::skip]
    let bytes = vec![
        // 1: compile unit, has children
        0x01, 0x11, 0x01,
        0x03, 0x08, // name, string
        0x1b, 0x08, // comp_dir, string
        0x11, 0x01, // low_pc, addr
        0x12, 0x06, // high_pc, data4
        0x00, 0x00,
        // 2: subprogram, has children
        0x02, 0x2e, 0x01,
        0x03, 0x08, // name
        0x11, 0x01, // low_pc
        0x12, 0x06, // high_pc
        0x40, 0x0a, // frame_base, block1
        0x00, 0x00,
        // 3: formal parameter, no children
        0x03, 0x05, 0x00,
        0x03, 0x08, // name
        0x49, 0x13, // type, ref4
        0x02, 0x0a, // location, block1
        0x00, 0x00,
        // 4: base type, no children
        0x04, 0x24, 0x00,
        0x03, 0x08, // name
        0x0b, 0x0b, // byte_size, data1
        0x3e, 0x0b, // encoding, data1
        0x00, 0x00,
        // end of table
        0x00,
    ];
    bytes
}

fn debug_info() -> Vec<u8> {
    let length = Label::new();
    let start = Label::new();
    let end = Label::new();
    let int_ty = Label::new();
    let int_ref = Label::new();

    let section = Section::with_endian(Endian::Little);
    let origin = section.start();
    let section = section
        .D32(&length)
        .mark(&start)
        .D16(4) // version
        .D32(0) // abbrev offset
        .D8(4) // address size
        .D8(1) // compile unit
        .append_bytes(b"main.cpp\0")
        .append_bytes(b"/work\0")
        .D32(0x1000)
        .D32(0x1000)
        .mark(&int_ty)
        .D8(4) // base type
        .append_bytes(b"int\0")
        .D8(4)
        .D8(5)
        .D8(2) // subprogram "main"
        .append_bytes(b"main\0")
        .D32(0x1100)
        .D32(0x100)
        .D8(2)
        .D8(0x7d) // DW_OP_breg13
        .D8(0x00)
        .D8(3) // parameter "argc"
        .append_bytes(b"argc\0")
        .D32(&int_ref)
        .D8(2)
        .D8(0x91) // DW_OP_fbreg
        .D8(0x78) // -8
        .D8(0) // end subprogram
        .D8(0) // end unit
        .mark(&end);
    origin.set_const(0);
    length.set_const((&end - &start) as u64);
    int_ref.set_const((&int_ty - &origin) as u64);
    section.get_contents().unwrap()
}

fn debug_frame() -> Vec<u8> {
    let cie_length = Label::new();
    let cie_start = Label::new();
    let cie_end = Label::new();
    let fde_length = Label::new();
    let fde_start = Label::new();
    let fde_end = Label::new();

    let section = Section::with_endian(Endian::Little)
        .D32(&cie_length)
        .mark(&cie_start)
        .D32(0xffff_ffff) // CIE id
        .D8(3) // version
        .append_bytes(b"\0") // augmentation
        .D8(1) // code alignment
        .D8(0x7c) // data alignment -4
        .D8(14) // return address register
        .D8(0x0c) // DW_CFA_def_cfa r13, 8
        .D8(13)
        .D8(8)
        .D8(0x80 | 14) // DW_CFA_offset r14, cfa + 1 * -4
        .D8(1)
        .mark(&cie_end)
        .D32(&fde_length)
        .mark(&fde_start)
        .D32(0) // CIE pointer
        .D32(0x1100)
        .D32(0x100)
        .mark(&fde_end)
        .D32(0); // terminator
    cie_length.set_const((&cie_end - &cie_start) as u64);
    fde_length.set_const((&fde_end - &fde_start) as u64);
    section.get_contents().unwrap()
}

struct StoppedFrame;

impl EvalContext for StoppedFrame {
    fn register(&self, register: u16) -> Result<u64> {
        match register {
            13 => Ok(0x7000),
            _ => Err(Error::RegisterUnavailable(register)),
        }
    }
}

fn provider<'data>(
    debug_info: &'data [u8],
    debug_abbrev: &'data [u8],
    debug_frame: &'data [u8],
) -> DebugInfoProvider<'data> {
    let file = SymbolFile::new("/work/a.out", 4, RunTimeEndian::Little)
        .with_section(SectionId::DebugInfo, debug_info)
        .with_section(SectionId::DebugAbbrev, debug_abbrev)
        .with_section(SectionId::DebugFrame, debug_frame);
    DebugInfoProvider::new(file)
}

#[test]
fn breakpoint_round_trip() {
    let info = debug_info();
    let abbrev = debug_abbrev();
    let frame = debug_frame();
    let provider = provider(&info, &abbrev, &frame);

    // Where are we?
    let function = provider
        .function_at(0x1150, &NoProgress)
        .unwrap()
        .expect("0x1150 is inside main");
    assert_eq!(function.name.as_deref(), Some("main"));
    assert_eq!(function.bounds, Some((0x1100, 0x1200)));

    let unit = provider
        .unit_for_address(0x1150, &NoProgress)
        .unwrap()
        .unwrap();
    assert_eq!(unit.name.as_deref(), Some("main.cpp"));

    // What can we see, and where does it live?
    let visible = provider.variables_at(0x1150, &NoProgress).unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].variable.name.as_deref(), Some("argc"));

    let location = provider
        .variable_location(&visible[0], 0x1150, &StoppedFrame)
        .unwrap();
    // frame base = r13 = 0x7000, argc at fbreg -8.
    assert_eq!(
        location,
        VariableLocation::Memory {
            address: 0x6ff8,
            is_static: false
        }
    );

    // What is its type?
    let ty = provider
        .type_by_offset(visible[0].variable.type_ref.unwrap().offset(), &NoProgress)
        .unwrap();
    assert_eq!(ty.name(), Some("int"));
    assert_eq!(ty.byte_size(), Some(4));

    // Where did the caller's r14 go?
    let mut cfi = provider.call_frame_info().unwrap();
    let saved = cfi.recover_register(0x1150, 14, &StoppedFrame).unwrap();
    // CFA = r13 + 8 = 0x7008; r14 saved at CFA - 4.
    assert_eq!(
        saved,
        VariableLocation::Memory {
            address: 0x7004,
            is_static: false
        }
    );
}

#[test]
fn missing_sections_are_typed_errors() {
    let info = debug_info();
    let abbrev = debug_abbrev();
    let file = SymbolFile::new("/work/a.out", 4, RunTimeEndian::Little)
        .with_section(SectionId::DebugInfo, &info)
        .with_section(SectionId::DebugAbbrev, &abbrev);
    let provider = DebugInfoProvider::new(file);

    assert_eq!(
        provider.call_frame_info().err(),
        Some(Error::MissingSection(".debug_frame"))
    );
    // Queries that need only .debug_info still work.
    assert!(provider
        .function_at(0x1150, &NoProgress)
        .unwrap()
        .is_some());
}
