//! Validation of an image's file header against the architecture it will run on.

use elf::{abi::ET_DYN, endian::EndianParse, file::FileHeader};

use crate::{arch::RelocationArch, HeaderError};

/// Check that `ehdr` describes a little-endian, position-independent image for architecture `A`.
///
/// This must pass before anything in the image is interpreted: relocation type codes only have
/// meaning relative to the machine that declared them.
pub fn validate_header<A: RelocationArch, E: EndianParse>(
    ehdr: &FileHeader<E>,
) -> Result<(), HeaderError> {
    if ehdr.class != A::CLASS {
        return Err(HeaderError::ClassMismatch {
            expect: A::CLASS,
            got: ehdr.class,
        });
    }
    if !ehdr.endianness.is_little() {
        return Err(HeaderError::EndianMismatch);
    }
    if ehdr.e_type != ET_DYN {
        return Err(HeaderError::ELFTypeMismatch {
            expect: ET_DYN,
            got: ehdr.e_type,
        });
    }
    if ehdr.e_machine != A::MACHINE {
        return Err(HeaderError::MachineMismatch {
            expect: A::MACHINE,
            got: ehdr.e_machine,
        });
    }
    Ok(())
}
