//! Purpose: Client facade over the daemon-held macro space.
//! Exports: `MacroSpace` operations and the `MacroImage` result type.
//! Role: In-memory ops are single round trips; save/load stream the
//! Role: on-disk format through `core::image` codecs.
//! Invariants: Load validates the file header verbatim before transmitting
//! Invariants: any record; a failed save or load leaves the target file
//! Invariants: truncated and untrustworthy.
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use crate::api::compiler::Compiler;
use crate::api::context::{ClientContext, expect_ok};
use crate::core::error::{Error, ErrorKind};
use crate::core::image::{Descriptor, SpaceHeader, read_image, skip_image};
use crate::core::name::validate_macro_name;
use crate::core::wire::{Request, Subsystem, op};

/// A stored macro: the compiled image and its search-order position.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MacroImage {
    pub image: Vec<u8>,
    pub position: u32,
}

pub struct MacroSpace<'a> {
    context: &'a ClientContext,
}

impl<'a> MacroSpace<'a> {
    pub(crate) fn new(context: &'a ClientContext) -> Self {
        Self { context }
    }

    /// Add or replace a macro under `name` at search position `position`.
    pub fn add(&self, name: &str, image: Vec<u8>, position: u32) -> Result<(), Error> {
        validate_macro_name(name)?;
        self.context.call_expect_ok(
            &Request::new(Subsystem::Macro, op::macrospace::ADD)
                .with_params([u64::from(position), 0, 0])
                .with_name(name)
                .with_payload(image),
        )?;
        Ok(())
    }

    /// Compile a source file through the collaborator and store the result.
    /// A missing source or a failed compile both report `Source`.
    pub fn add_from_file(
        &self,
        name: &str,
        path: &Path,
        position: u32,
        compiler: &dyn Compiler,
    ) -> Result<(), Error> {
        validate_macro_name(name)?;
        let source = std::fs::read_to_string(path).map_err(|err| {
            Error::new(ErrorKind::Source)
                .with_message("cannot read macro source")
                .with_path(path)
                .with_source(err)
        })?;
        let image = compiler.compile(&source)?;
        self.add(name, image, position)
    }

    pub fn remove(&self, name: &str) -> Result<(), Error> {
        self.context.call_expect_ok(
            &Request::new(Subsystem::Macro, op::macrospace::REMOVE).with_name(name),
        )?;
        Ok(())
    }

    pub fn clear(&self) -> Result<(), Error> {
        self.context
            .call_expect_ok(&Request::new(Subsystem::Macro, op::macrospace::CLEAR))?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<MacroImage, Error> {
        let response = self.context.call_expect_ok(
            &Request::new(Subsystem::Macro, op::macrospace::GET).with_name(name),
        )?;
        Ok(MacroImage {
            image: response.payload,
            position: response.params[0] as u32,
        })
    }

    /// Search-order position of a stored macro.
    pub fn query(&self, name: &str) -> Result<u32, Error> {
        let response = self.context.call_expect_ok(
            &Request::new(Subsystem::Macro, op::macrospace::QUERY).with_name(name),
        )?;
        Ok(response.params[0] as u32)
    }

    pub fn reorder(&self, name: &str, position: u32) -> Result<(), Error> {
        self.context.call_expect_ok(
            &Request::new(Subsystem::Macro, op::macrospace::REORDER)
                .with_params([u64::from(position), 0, 0])
                .with_name(name),
        )?;
        Ok(())
    }

    pub fn count(&self) -> Result<u64, Error> {
        let response = self
            .context
            .call_expect_ok(&Request::new(Subsystem::Macro, op::macrospace::COUNT))?;
        Ok(response.params[0])
    }

    /// Save macros to `path`. With `names`, each record is fetched
    /// individually; without, the whole space is streamed through the
    /// daemon's per-connection iteration cursor in two passes (descriptors,
    /// then images), so no image is held longer than one write.
    pub fn save(&self, path: &Path, names: Option<&[String]>) -> Result<(), Error> {
        match names {
            Some(names) => self.save_selected(path, names),
            None => self.save_all(path),
        }
    }

    fn save_all(&self, path: &Path) -> Result<(), Error> {
        self.context.with_connection(|connection| {
            let begin = expect_ok(
                connection.call(&Request::new(Subsystem::Macro, op::macrospace::ITER_BEGIN))?,
            )?;
            let count = begin.params[0];
            let mut writer = BufWriter::new(create_file(path)?);
            let header = SpaceHeader {
                count: u32::try_from(count).map_err(|_| {
                    Error::new(ErrorKind::Exhausted).with_message("too many macros for one file")
                })?,
            };
            header.write_to(&mut writer)?;
            for _ in 0..count {
                let response = expect_ok(connection.call(&Request::new(
                    Subsystem::Macro,
                    op::macrospace::ITER_DESCRIPTOR,
                ))?)?;
                let name = String::from_utf8(response.payload).map_err(|_| {
                    Error::new(ErrorKind::Protocol).with_message("macro name not UTF-8")
                })?;
                Descriptor::new(name, response.params[0] as u32, response.params[1] as u32)
                    .write_to(&mut writer)?;
            }
            for _ in 0..count {
                let response = expect_ok(
                    connection
                        .call(&Request::new(Subsystem::Macro, op::macrospace::ITER_IMAGE))?,
                )?;
                writer.write_all(&response.payload).map_err(write_error)?;
            }
            writer.flush().map_err(write_error)
        })
    }

    fn save_selected(&self, path: &Path, names: &[String]) -> Result<(), Error> {
        let mut records = Vec::with_capacity(names.len());
        for name in names {
            let stored = self.get(name)?;
            records.push((name.clone(), stored));
        }
        let mut writer = BufWriter::new(create_file(path)?);
        let header = SpaceHeader {
            count: records.len() as u32,
        };
        header.write_to(&mut writer)?;
        for (name, stored) in &records {
            Descriptor::new(name.clone(), stored.image.len() as u32, stored.position)
                .write_to(&mut writer)?;
        }
        for (_, stored) in &records {
            writer.write_all(&stored.image).map_err(write_error)?;
        }
        writer.flush().map_err(write_error)
    }

    /// Load macros from `path` into the space, replacing same-named entries.
    /// With `names`, only matching records (case-insensitively) are loaded;
    /// unselected images are seeked past, never deserialized.
    pub fn load(&self, path: &Path, names: Option<&[String]>) -> Result<(), Error> {
        let file = File::open(path).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("cannot open macro space file")
                .with_path(path)
                .with_source(err)
        })?;
        let mut reader = BufReader::new(file);
        let header = SpaceHeader::read_from(&mut reader)?;
        let mut descriptors = Vec::with_capacity(header.count as usize);
        for _ in 0..header.count {
            descriptors.push(Descriptor::read_from(&mut reader)?);
        }
        for descriptor in &descriptors {
            let wanted = names.is_none_or(|names| {
                names
                    .iter()
                    .any(|name| name.eq_ignore_ascii_case(&descriptor.name))
            });
            if wanted {
                let image = read_image(&mut reader, descriptor.image_len)?;
                self.add(&descriptor.name, image, descriptor.order)?;
            } else {
                skip_image(&mut reader, descriptor.image_len)?;
            }
        }
        Ok(())
    }
}

fn create_file(path: &Path) -> Result<File, Error> {
    File::create(path).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("cannot create macro space file")
            .with_path(path)
            .with_source(err)
    })
}

fn write_error(err: std::io::Error) -> Error {
    Error::new(ErrorKind::Io)
        .with_message("failed to write macro space file")
        .with_source(err)
}
