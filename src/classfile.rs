//! Constant-pool codec for compiled class units.
//!
//! Relocation only ever needs the constant pool: every class name, descriptor
//! and signature a unit mentions is stored there as a `CONSTANT_Utf8` entry.
//! The pool is decoded into [`Constant`]s, everything after it (access flags,
//! fields, methods, attributes) is kept as opaque bytes and written back
//! untouched.

use crate::error::ClassFileError;

const MAGIC: u32 = 0xCAFE_BABE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constant {
    /// Slot 0, and the slot following a `Long` or `Double`.
    Unusable,
    Utf8(Vec<u8>),
    /// Index of the `Utf8` holding the internal name.
    Class(u16),
    /// Constants without name references, kept verbatim.
    Raw { tag: u8, data: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassFile {
    minor: u16,
    major: u16,
    pool: Vec<Constant>,
    access_flags: u16,
    this_class: u16,
    tail: Vec<u8>,
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ClassFileError> {
        let end = self.pos + n;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or(ClassFileError::Truncated(self.pos))?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ClassFileError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ClassFileError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ClassFileError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

impl ClassFile {
    pub fn parse(bytes: &[u8]) -> Result<Self, ClassFileError> {
        let mut r = Reader { bytes, pos: 0 };

        let magic = r.u32()?;
        if magic != MAGIC {
            return Err(ClassFileError::BadMagic(magic));
        }

        let minor = r.u16()?;
        let major = r.u16()?;
        let count = r.u16()?;

        let mut pool = Vec::with_capacity(count as usize);
        pool.push(Constant::Unusable);

        let mut index = 1;
        while index < count {
            let tag = r.u8()?;
            let constant = match tag {
                1 => {
                    let len = r.u16()? as usize;
                    Constant::Utf8(r.take(len)?.to_vec())
                }
                7 => Constant::Class(r.u16()?),
                // String, MethodType, Module, Package
                8 | 16 | 19 | 20 => Constant::Raw {
                    tag,
                    data: r.take(2)?.to_vec(),
                },
                // Integer, Float, Fieldref, Methodref, InterfaceMethodref,
                // NameAndType, Dynamic, InvokeDynamic
                3 | 4 | 9 | 10 | 11 | 12 | 17 | 18 => Constant::Raw {
                    tag,
                    data: r.take(4)?.to_vec(),
                },
                // MethodHandle
                15 => Constant::Raw {
                    tag,
                    data: r.take(3)?.to_vec(),
                },
                // Long, Double
                5 | 6 => {
                    pool.push(Constant::Raw {
                        tag,
                        data: r.take(8)?.to_vec(),
                    });
                    pool.push(Constant::Unusable);
                    index += 2;
                    continue;
                }
                _ => return Err(ClassFileError::UnknownTag { tag, index }),
            };
            pool.push(constant);
            index += 1;
        }

        let access_flags = r.u16()?;
        let this_class = r.u16()?;
        let tail = bytes[r.pos..].to_vec();

        Ok(Self {
            minor,
            major,
            pool,
            access_flags,
            this_class,
            tail,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.tail.len() + 64 * self.pool.len());
        out.extend_from_slice(&MAGIC.to_be_bytes());
        out.extend_from_slice(&self.minor.to_be_bytes());
        out.extend_from_slice(&self.major.to_be_bytes());
        out.extend_from_slice(&(self.pool.len() as u16).to_be_bytes());

        for constant in &self.pool[1..] {
            match constant {
                Constant::Unusable => {}
                Constant::Utf8(bytes) => {
                    out.push(1);
                    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                    out.extend_from_slice(bytes);
                }
                Constant::Class(index) => {
                    out.push(7);
                    out.extend_from_slice(&index.to_be_bytes());
                }
                Constant::Raw { tag, data } => {
                    out.push(*tag);
                    out.extend_from_slice(data);
                }
            }
        }

        out.extend_from_slice(&self.access_flags.to_be_bytes());
        out.extend_from_slice(&self.this_class.to_be_bytes());
        out.extend_from_slice(&self.tail);
        out
    }

    fn utf8(&self, index: u16) -> Result<&[u8], ClassFileError> {
        match self.pool.get(index as usize) {
            Some(Constant::Utf8(bytes)) => Ok(bytes),
            _ => Err(ClassFileError::BadIndex(index)),
        }
    }

    fn class_name(&self, index: u16) -> Result<String, ClassFileError> {
        match self.pool.get(index as usize) {
            Some(Constant::Class(name)) => {
                Ok(String::from_utf8_lossy(self.utf8(*name)?).into_owned())
            }
            _ => Err(ClassFileError::BadIndex(index)),
        }
    }

    /// Internal name (`com/example/Foo`) of the unit itself.
    pub fn name(&self) -> Result<String, ClassFileError> {
        self.class_name(self.this_class)
    }

    /// Internal names of every other class this unit refers to. Array types
    /// are reduced to their element class, primitive arrays are dropped.
    pub fn class_references(&self) -> Result<Vec<String>, ClassFileError> {
        let mut names = Vec::new();

        for (index, constant) in self.pool.iter().enumerate() {
            if index as u16 == self.this_class || !matches!(constant, Constant::Class(_)) {
                continue;
            }

            let name = self.class_name(index as u16)?;
            let element = name.trim_start_matches('[');
            let element = if element.len() == name.len() {
                Some(element)
            } else {
                element
                    .strip_prefix('L')
                    .and_then(|rest| rest.strip_suffix(';'))
            };

            if let Some(element) = element {
                names.push(element.to_string());
            }
        }

        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Rewrites every UTF-8 constant `rewrite` returns a replacement for.
    /// Returns whether anything changed.
    pub fn rewrite_utf8(
        &mut self,
        rewrite: impl Fn(&str) -> Option<String>,
    ) -> Result<bool, ClassFileError> {
        let mut changed = false;

        for constant in &mut self.pool {
            let Constant::Utf8(bytes) = constant else {
                continue;
            };
            // Modified UTF-8 that is not valid UTF-8 (encoded NUL, surrogate
            // pairs) never contains a plain ASCII package name.
            let Ok(text) = std::str::from_utf8(bytes) else {
                continue;
            };

            if let Some(replacement) = rewrite(text) {
                if replacement.len() > u16::MAX as usize {
                    return Err(ClassFileError::Overflow);
                }
                *bytes = replacement.into_bytes();
                changed = true;
            }
        }

        Ok(changed)
    }

    /// Smallest valid unit named `name`, extending `super_name` and referring
    /// to `references`. Stands in for compiler output in dry runs and tests.
    pub fn stub(name: &str, super_name: &str, references: &[&str]) -> Self {
        let mut pool = vec![Constant::Unusable];
        let class = |name: &str, pool: &mut Vec<Constant>| -> u16 {
            pool.push(Constant::Utf8(name.as_bytes().to_vec()));
            pool.push(Constant::Class((pool.len() - 1) as u16));
            (pool.len() - 1) as u16
        };

        let this_class = class(name, &mut pool);
        let super_class = class(super_name, &mut pool);
        for reference in references {
            class(reference, &mut pool);
        }

        let mut tail = Vec::new();
        tail.extend_from_slice(&super_class.to_be_bytes());
        // interfaces, fields, methods, attributes
        tail.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0]);

        Self {
            minor: 0,
            major: 52,
            pool,
            access_flags: 0x0021,
            this_class,
            tail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_roundtrip() {
        let unit = ClassFile::stub("com/example/Main", "java/lang/Object", &["lib/a/Gson"]);
        let bytes = unit.to_bytes();
        let parsed = ClassFile::parse(&bytes).unwrap();

        assert_eq!(parsed, unit);
        assert_eq!(parsed.to_bytes(), bytes);
        assert_eq!(parsed.name().unwrap(), "com/example/Main");
        assert_eq!(
            parsed.class_references().unwrap(),
            ["java/lang/Object", "lib/a/Gson"]
        );
    }

    #[test]
    fn test_array_references() {
        let unit = ClassFile::stub("a/B", "java/lang/Object", &["[[Lx/Y;", "[I"]);
        assert_eq!(unit.class_references().unwrap(), ["java/lang/Object", "x/Y"]);
    }

    #[test]
    fn test_wide_constants_take_two_slots() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC.to_be_bytes());
        bytes.extend_from_slice(&[0, 0, 0, 52]);
        // 1: Long (+ unusable 2), 3: Utf8 "a/B", 4: Class -> 3
        bytes.extend_from_slice(&5u16.to_be_bytes());
        bytes.push(5);
        bytes.extend_from_slice(&42u64.to_be_bytes());
        bytes.push(1);
        bytes.extend_from_slice(&3u16.to_be_bytes());
        bytes.extend_from_slice(b"a/B");
        bytes.push(7);
        bytes.extend_from_slice(&3u16.to_be_bytes());
        bytes.extend_from_slice(&0x21u16.to_be_bytes());
        bytes.extend_from_slice(&4u16.to_be_bytes());
        bytes.extend_from_slice(&[0; 10]);

        let unit = ClassFile::parse(&bytes).unwrap();
        assert_eq!(unit.name().unwrap(), "a/B");
        assert_eq!(unit.to_bytes(), bytes);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            ClassFile::parse(b"PK\x03\x04rest"),
            Err(ClassFileError::BadMagic(_))
        ));
        assert!(matches!(
            ClassFile::parse(&[0xCA, 0xFE, 0xBA, 0xBE, 0]),
            Err(ClassFileError::Truncated(_))
        ));
    }

    #[test]
    fn test_rewrite_utf8() {
        let mut unit = ClassFile::stub("a/B", "java/lang/Object", &["old/pkg/C"]);
        let changed = unit
            .rewrite_utf8(|s| s.strip_prefix("old/").map(|rest| format!("new/{rest}")))
            .unwrap();

        assert!(changed);
        assert_eq!(unit.class_references().unwrap(), ["java/lang/Object", "new/pkg/C"]);
    }
}
