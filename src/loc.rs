//! Location providers: where is this variable, at this address?
//!
//! A variable's location attribute is either one static expression, valid
//! everywhere the variable is in scope, or a `.debug_loc` list mapping PC
//! ranges to expressions for variables that move between registers and the
//! stack. Either way evaluation is a fresh query per address; nothing is
//! cached here.

use crate::buf::EndianBuf;
use crate::endian::RunTimeEndian;
use crate::error::{Error, Result};
use crate::op::{self, EvalContext, VariableLocation};

/// One PC range of a location list, with its expression bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocListEntry {
    pub begin: u64,
    pub end: u64,
    pub expr: Vec<u8>,
}

/// A variable's location attribute, owned by the variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationProvider {
    /// A single expression valid for the variable's whole scope.
    Expression(Vec<u8>),
    /// PC-range-indexed expressions from `.debug_loc`.
    List(Vec<LocListEntry>),
}

impl LocationProvider {
    /// Parse the location list at `offset` in `.debug_loc`.
    ///
    /// `base_address` is the owning compilation unit's low address;
    /// base-address-selection entries replace it mid-list.
    pub fn parse_list(
        debug_loc: EndianBuf<'_>,
        offset: usize,
        base_address: u64,
        address_size: u8,
    ) -> Result<LocationProvider> {
        let mut buf = debug_loc.range_from(offset)?;
        let tombstone = max_address(address_size);
        let mut base = base_address;
        let mut entries = Vec::new();

        loop {
            let begin = buf.read_address(address_size)?;
            let end = buf.read_address(address_size)?;
            if begin == 0 && end == 0 {
                break;
            }
            if begin == tombstone {
                base = end;
                continue;
            }
            let len = buf.read_u16()? as usize;
            let expr = buf.split(len)?;
            // Empty ranges occur when a linker discards code; keep the
            // stream position but drop the entry.
            if begin < end {
                entries.push(LocListEntry {
                    begin: base.wrapping_add(begin),
                    end: base.wrapping_add(end),
                    expr: expr.bytes().to_vec(),
                });
            }
        }

        Ok(LocationProvider::List(entries))
    }

    /// The expression bytes that cover `address`, or the single
    /// expression for the non-list case.
    pub fn expression_for(&self, address: u64) -> Result<&[u8]> {
        match self {
            LocationProvider::Expression(bytes) => Ok(bytes),
            LocationProvider::List(entries) => entries
                .iter()
                .find(|entry| entry.begin <= address && address < entry.end)
                .map(|entry| entry.expr.as_slice())
                .ok_or(Error::NoLocationForAddress(address)),
        }
    }

    /// Evaluate the location at `address` against a child frame.
    ///
    /// A list with no covering entry fails with
    /// [`Error::NoLocationForAddress`]; the caller decides whether an
    /// enclosing scope's provider applies instead.
    pub fn evaluate(
        &self,
        address: u64,
        endian: RunTimeEndian,
        address_size: u8,
        ctx: &dyn EvalContext,
    ) -> Result<VariableLocation> {
        let expr = self.expression_for(address)?;
        op::evaluate(EndianBuf::new(expr, endian), address_size, ctx)
    }
}

fn max_address(address_size: u8) -> u64 {
    match address_size {
        2 => u64::from(u16::MAX),
        4 => u64::from(u32::MAX),
        _ => u64::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_assembler::{Endian, Section};

    fn assemble_list() -> Vec<u8> {
        // Base address 0x1000 from the unit; one base-selection entry
        // switches to 0x2000 partway through.
        Section::with_endian(Endian::Little)
            // [0x1000+0x10, 0x1000+0x20): DW_OP_reg0
            .D32(0x10)
            .D32(0x20)
            .D16(1)
            .D8(0x50)
            // base address selection -> 0x2000
            .D32(0xffff_ffff)
            .D32(0x2000)
            // [0x2000+0x10, 0x2000+0x20): DW_OP_reg1
            .D32(0x10)
            .D32(0x20)
            .D16(1)
            .D8(0x51)
            // end of list
            .D32(0)
            .D32(0)
            .get_contents()
            .unwrap()
    }

    struct NoFrame;
    impl EvalContext for NoFrame {
        fn register(&self, register: u16) -> Result<u64> {
            Err(Error::RegisterUnavailable(register))
        }
    }

    #[test]
    fn test_list_with_base_selection() {
        let bytes = assemble_list();
        let debug_loc = EndianBuf::new(&bytes, RunTimeEndian::Little);
        let provider = LocationProvider::parse_list(debug_loc, 0, 0x1000, 4).unwrap();

        match &provider {
            LocationProvider::List(entries) => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0].begin, 0x1010);
                assert_eq!(entries[0].end, 0x1020);
                assert_eq!(entries[1].begin, 0x2010);
                assert_eq!(entries[1].end, 0x2020);
            }
            otherwise => panic!("Unexpected provider: {:?}", otherwise),
        }

        assert_eq!(provider.expression_for(0x1018).unwrap(), &[0x50]);
        assert_eq!(provider.expression_for(0x2010).unwrap(), &[0x51]);
        assert_eq!(
            provider.expression_for(0x1800),
            Err(Error::NoLocationForAddress(0x1800))
        );
    }

    #[test]
    fn test_list_matches_single_expression() {
        // Evaluating a list entry must equal evaluating its expression
        // directly.
        let bytes = assemble_list();
        let debug_loc = EndianBuf::new(&bytes, RunTimeEndian::Little);
        let list = LocationProvider::parse_list(debug_loc, 0, 0x1000, 4).unwrap();
        let single = LocationProvider::Expression(vec![0x50]);

        let from_list = list
            .evaluate(0x1015, RunTimeEndian::Little, 4, &NoFrame)
            .unwrap();
        let from_single = single
            .evaluate(0x1015, RunTimeEndian::Little, 4, &NoFrame)
            .unwrap();
        assert_eq!(from_list, from_single);
        assert_eq!(from_list, VariableLocation::Register { register: 0 });
    }

    #[test]
    fn test_single_expression_covers_everything() {
        let provider = LocationProvider::Expression(vec![0x52]);
        assert_eq!(provider.expression_for(0).unwrap(), &[0x52]);
        assert_eq!(provider.expression_for(u64::MAX).unwrap(), &[0x52]);
    }
}
