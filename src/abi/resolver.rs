//! The two directions of the marshalling layer.
//!
//! [`resolve`] walks a [`ParamSpec`] in order, pulling raw words from the
//! convention's slot sequence and decoding them into typed values. Decode
//! failures are recovered locally: the affected parameter gets its
//! best-effort partial value and the fault is returned alongside the result
//! for the trace channel. [`commit`] is the inverse: any mutated entry is
//! re-encoded into its original storage, in place, idempotently.
//!
//! Trailing arguments of variadic APIs resolve through [`VariadicCursor`],
//! which freezes the slot cursor at the marker position and replays slots by
//! explicit index. Unlike bulk resolution, on-demand reads propagate
//! [`Error::Decode`] to the caller, which knows (from the format string or
//! similar) whether the read should have succeeded.

use crate::{
    abi::{ArgSlot, CallingConvention, ParamKind, ParamSpec, ParamValue, ResolvedParams, SlotCursor},
    abi::params::ParamEntry,
    cpu::{CpuCore, GuestAddress},
    memory::MemoryView,
    Error, Result,
};

/// Resolves the declared parameters of an intercepted call.
///
/// Pulls one raw word per parameter from the convention's slot sequence
/// (registers first, then stack, skipping the return address) and decodes it
/// per the declared kind. Indirect kinds dereference through `memory`.
///
/// Returns the resolved view and any non-fatal decode faults that were
/// recovered along the way. A misdeclared convention cannot be detected here;
/// the resolved values are then garbage and no fault is raised for it.
#[must_use]
pub fn resolve(
    core: &dyn CpuCore,
    memory: &MemoryView,
    convention: CallingConvention,
    spec: &ParamSpec,
) -> (ResolvedParams, Vec<Error>) {
    let width = memory.width();
    let stack_pointer = GuestAddress::new(width.truncate(
        core.read_register(crate::cpu::Register::Rsp),
    ));
    let mut cursor = SlotCursor::new(convention, width, stack_pointer);
    let mut params = ResolvedParams::default();
    let mut faults = Vec::new();

    for (name, kind) in spec.entries() {
        if *kind == ParamKind::Variadic {
            params.variadic = Some(VariadicCursor { cursor });
            break;
        }

        let slot = cursor.advance();
        let raw = match read_slot(core, memory, slot) {
            Ok(word) => width.truncate(word),
            Err(fault) => {
                faults.push(fault);
                0
            }
        };

        let value = match decode(memory, *kind, raw) {
            Ok(value) => value,
            Err(fault) => {
                let fallback = partial_value(*kind, raw, &fault);
                faults.push(fault);
                fallback
            }
        };

        params.entries.push(ParamEntry {
            name: name.clone(),
            kind: *kind,
            slot,
            raw,
            original: value.clone(),
            value,
        });
    }

    params.stack_words = cursor.stack_words();
    (params, faults)
}

/// Re-encodes mutated parameters back into their original storage.
///
/// Word-representable values are written to the register or stack slot they
/// were pulled from; string and buffer values are written through the pointer
/// word that slot still holds. Unmodified entries are untouched, a value is
/// never moved to a different slot, and committing twice writes the same
/// bytes twice.
///
/// # Errors
///
/// Fails with [`Error::Decode`] if a mutated value must be written through a
/// pointer into unmapped memory. The dispatch engine reports this through the
/// trace channel and continues.
pub fn commit(
    core: &mut dyn CpuCore,
    memory: &mut MemoryView,
    params: &ResolvedParams,
) -> Result<()> {
    let width = memory.width();

    for entry in &params.entries {
        if entry.value == entry.original {
            continue;
        }

        match &entry.value {
            ParamValue::Str(text) => {
                let mut bytes = text.clone().into_bytes();
                bytes.push(0);
                memory.write_bytes(GuestAddress::new(entry.raw), &bytes)?;
            }
            ParamValue::WStr(text) => {
                let mut bytes: Vec<u8> = text
                    .encode_utf16()
                    .flat_map(|unit| unit.to_le_bytes())
                    .collect();
                bytes.extend_from_slice(&[0, 0]);
                memory.write_bytes(GuestAddress::new(entry.raw), &bytes)?;
            }
            ParamValue::Buffer(bytes) => {
                memory.write_bytes(GuestAddress::new(entry.raw), bytes)?;
            }
            word_value => {
                let word = width.truncate(word_value.as_word().unwrap_or(entry.raw));
                match entry.slot {
                    ArgSlot::Register(reg) => core.write_register(reg, word),
                    ArgSlot::Stack(addr) => memory.write_word(addr, word)?,
                }
            }
        }
    }
    Ok(())
}

/// The slot cursor frozen at a spec's variadic marker.
///
/// Trailing arguments are resolved on demand with an explicit index relative
/// to the marker, after the caller has inspected the fixed arguments (e.g. a
/// format string) to learn how many exist and what types they carry.
#[derive(Clone, Copy, Debug)]
pub struct VariadicCursor {
    pub(crate) cursor: SlotCursor,
}

impl VariadicCursor {
    /// Resolves the trailing argument `index` slots past the marker.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Decode`] when the slot or a dereferenced string
    /// cannot be read, typically because the index ran past the caller's
    /// actual argument area. The failure is local to this read; the session
    /// continues.
    pub fn read(
        &self,
        core: &dyn CpuCore,
        memory: &MemoryView,
        index: u64,
        kind: ParamKind,
    ) -> Result<ParamValue> {
        if kind == ParamKind::Variadic {
            return Err(Error::Decode {
                message: "variadic marker is not a readable kind".to_string(),
                partial: None,
            });
        }
        let slot = self.cursor.peek(index);
        let raw = memory.width().truncate(read_slot(core, memory, slot)?);
        decode(memory, kind, raw)
    }
}

fn read_slot(core: &dyn CpuCore, memory: &MemoryView, slot: ArgSlot) -> Result<u64> {
    match slot {
        ArgSlot::Register(reg) => Ok(core.read_register(reg)),
        ArgSlot::Stack(addr) => memory.read_word(addr),
    }
}

fn decode(memory: &MemoryView, kind: ParamKind, raw: u64) -> Result<ParamValue> {
    Ok(match kind {
        ParamKind::I8 => ParamValue::I8(raw as i8),
        ParamKind::U8 => ParamValue::U8(raw as u8),
        ParamKind::I16 => ParamValue::I16(raw as i16),
        ParamKind::U16 => ParamValue::U16(raw as u16),
        ParamKind::I32 => ParamValue::I32(raw as i32),
        ParamKind::U32 => ParamValue::U32(raw as u32),
        ParamKind::I64 => ParamValue::I64(raw as i64),
        ParamKind::U64 => ParamValue::U64(raw),
        ParamKind::Pointer => ParamValue::Pointer(GuestAddress::new(raw)),
        ParamKind::Str => ParamValue::Str(memory.read_c_string(GuestAddress::new(raw))?),
        ParamKind::WStr => ParamValue::WStr(memory.read_wide_string(GuestAddress::new(raw))?),
        ParamKind::Buffer(len) => {
            ParamValue::Buffer(memory.read_bytes(GuestAddress::new(raw), len)?)
        }
        ParamKind::Variadic => {
            return Err(Error::Decode {
                message: "variadic marker cannot be decoded directly".to_string(),
                partial: None,
            })
        }
    })
}

/// Best-effort fallback for a kind whose decode faulted.
fn partial_value(kind: ParamKind, raw: u64, fault: &Error) -> ParamValue {
    let partial_text = match fault {
        Error::Decode { partial, .. } => partial.clone().unwrap_or_default(),
        _ => String::new(),
    };
    match kind {
        ParamKind::Str => ParamValue::Str(partial_text),
        ParamKind::WStr => ParamValue::WStr(partial_text),
        ParamKind::Buffer(_) => ParamValue::Buffer(Vec::new()),
        ParamKind::Pointer => ParamValue::Pointer(GuestAddress::new(raw)),
        _ => ParamValue::U64(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cpu::Register,
        memory::PointerWidth,
        test::FakeCore,
    };

    /// Lays out a 32-bit cdecl frame: return address at esp, args above it.
    fn cdecl_frame(args: &[u32]) -> (FakeCore, MemoryView) {
        let mut core = FakeCore::new();
        let mut memory = MemoryView::new(PointerWidth::Bits32);
        memory.map(GuestAddress::new(0x6000), 0x1000).unwrap();

        let sp = 0x6800u64;
        core.write_register(Register::Rsp, sp);
        memory.write_u32(GuestAddress::new(sp), 0x0040_1234).unwrap(); // return address
        for (index, arg) in args.iter().enumerate() {
            memory
                .write_u32(GuestAddress::new(sp + 4 + 4 * index as u64), *arg)
                .unwrap();
        }
        (core, memory)
    }

    #[test]
    fn test_resolve_cdecl_integers() {
        let (core, memory) = cdecl_frame(&[7, 0xFFFF_FFFF]);
        let spec = ParamSpec::new()
            .with("count", ParamKind::U32)
            .with("mode", ParamKind::I32);

        let (params, faults) = resolve(&core, &memory, CallingConvention::Cdecl, &spec);
        assert!(faults.is_empty());
        assert_eq!(params.get("count"), Some(&ParamValue::U32(7)));
        assert_eq!(params.get("mode"), Some(&ParamValue::I32(-1)));
        assert_eq!(params.stack_words(), 2);
    }

    #[test]
    fn test_resolve_string_through_pointer() {
        let (core, mut memory) = cdecl_frame(&[0x6100]);
        memory
            .write_bytes(GuestAddress::new(0x6100), b"abc\0")
            .unwrap();
        let spec = ParamSpec::new().with("str", ParamKind::Str);

        let (params, faults) = resolve(&core, &memory, CallingConvention::Cdecl, &spec);
        assert!(faults.is_empty());
        assert_eq!(params.get("str").unwrap().as_str(), Some("abc"));
    }

    #[test]
    fn test_resolve_recovers_partial_string() {
        // Pointer to the very end of a region: bytes but no terminator.
        let (core, mut memory) = cdecl_frame(&[0x6FFC]);
        memory
            .write_bytes(GuestAddress::new(0x6FFC), b"wxyz")
            .unwrap();
        let spec = ParamSpec::new().with("str", ParamKind::Str);

        let (params, faults) = resolve(&core, &memory, CallingConvention::Cdecl, &spec);
        assert_eq!(faults.len(), 1);
        assert_eq!(params.get("str").unwrap().as_str(), Some("wxyz"));
    }

    #[test]
    fn test_commit_round_trip_is_idempotent() {
        let (mut core, mut memory) = cdecl_frame(&[41, 0x6100]);
        memory
            .write_bytes(GuestAddress::new(0x6100), b"old\0")
            .unwrap();
        let spec = ParamSpec::new()
            .with("n", ParamKind::U32)
            .with("s", ParamKind::Str);

        let (params, _) = resolve(&core, &memory, CallingConvention::Cdecl, &spec);
        // No mutation: commit twice, then re-resolve must match.
        commit(&mut core, &mut memory, &params).unwrap();
        commit(&mut core, &mut memory, &params).unwrap();

        let (again, faults) = resolve(&core, &memory, CallingConvention::Cdecl, &spec);
        assert!(faults.is_empty());
        assert_eq!(again.get("n"), Some(&ParamValue::U32(41)));
        assert_eq!(again.get("s").unwrap().as_str(), Some("old"));
    }

    #[test]
    fn test_commit_writes_mutations_in_place() {
        let (mut core, mut memory) = cdecl_frame(&[41, 0x6100]);
        memory
            .write_bytes(GuestAddress::new(0x6100), b"old\0")
            .unwrap();
        let spec = ParamSpec::new()
            .with("n", ParamKind::U32)
            .with("s", ParamKind::Str);

        let (mut params, _) = resolve(&core, &memory, CallingConvention::Cdecl, &spec);
        params.set("n", ParamValue::U32(99));
        params.set("s", ParamValue::Str("new".to_string()));
        commit(&mut core, &mut memory, &params).unwrap();

        let (again, _) = resolve(&core, &memory, CallingConvention::Cdecl, &spec);
        assert_eq!(again.get("n"), Some(&ParamValue::U32(99)));
        assert_eq!(again.get("s").unwrap().as_str(), Some("new"));
    }

    #[test]
    fn test_commit_register_slot() {
        let mut core = FakeCore::new();
        let mut memory = MemoryView::new(PointerWidth::Bits64);
        memory.map(GuestAddress::new(0x6000), 0x1000).unwrap();
        core.write_register(Register::Rsp, 0x6800);
        core.write_register(Register::Rcx, 5);

        let spec = ParamSpec::new().with("n", ParamKind::U32);
        let (mut params, _) = resolve(&core, &memory, CallingConvention::Ms64, &spec);
        assert_eq!(params.get("n"), Some(&ParamValue::U32(5)));

        params.set("n", ParamValue::U32(6));
        commit(&mut core, &mut memory, &params).unwrap();
        assert_eq!(core.read_register(Register::Rcx), 6);
    }

    #[test]
    fn test_variadic_cursor_reads_by_index() {
        let (core, mut memory) = cdecl_frame(&[0x6100, 11, 22]);
        memory
            .write_bytes(GuestAddress::new(0x6100), b"%d %d\0")
            .unwrap();
        let spec = ParamSpec::new()
            .with("format", ParamKind::Str)
            .with("args", ParamKind::Variadic);

        let (params, _) = resolve(&core, &memory, CallingConvention::Cdecl, &spec);
        let cursor = params.variadic().expect("cursor frozen at marker");
        assert_eq!(
            cursor.read(&core, &memory, 0, ParamKind::U32).unwrap(),
            ParamValue::U32(11)
        );
        assert_eq!(
            cursor.read(&core, &memory, 1, ParamKind::U32).unwrap(),
            ParamValue::U32(22)
        );
    }

    #[test]
    fn test_variadic_read_past_frame_is_decode_error() {
        let mut core = FakeCore::new();
        let mut memory = MemoryView::new(PointerWidth::Bits32);
        // Tiny stack: return address + format pointer + two variadic words.
        memory.map(GuestAddress::new(0x7000), 16).unwrap();
        core.write_register(Register::Rsp, 0x7000);

        let spec = ParamSpec::new()
            .with("format", ParamKind::Pointer)
            .with("args", ParamKind::Variadic);
        let (params, _) = resolve(&core, &memory, CallingConvention::Cdecl, &spec);
        let cursor = params.variadic().unwrap();

        assert!(cursor.read(&core, &memory, 0, ParamKind::U32).is_ok());
        assert!(cursor.read(&core, &memory, 1, ParamKind::U32).is_ok());
        let err = cursor.read(&core, &memory, 2, ParamKind::U32).unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }
}
