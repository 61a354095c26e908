// Shared model types crossing the wire between client and daemon.
use crate::core::error::{Error, ErrorKind};

pub const MAX_USER_DATA: usize = 4096;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InsertOrder {
    Fifo,
    Lifo,
}

impl InsertOrder {
    pub fn from_u64(value: u64) -> Result<Self, Error> {
        match value {
            0 => Ok(InsertOrder::Fifo),
            1 => Ok(InsertOrder::Lifo),
            _ => Err(Error::new(ErrorKind::Protocol).with_message("unknown insert order")),
        }
    }

    pub fn as_u64(self) -> u64 {
        match self {
            InsertOrder::Fifo => 0,
            InsertOrder::Lifo => 1,
        }
    }
}

/// The three independent callback-binding namespaces.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CallbackType {
    Subcommand,
    Exit,
    Function,
}

impl CallbackType {
    pub fn from_u64(value: u64) -> Result<Self, Error> {
        match value {
            0 => Ok(CallbackType::Subcommand),
            1 => Ok(CallbackType::Exit),
            2 => Ok(CallbackType::Function),
            _ => Err(Error::new(ErrorKind::Protocol).with_message("unknown callback type")),
        }
    }

    pub fn as_u64(self) -> u64 {
        match self {
            CallbackType::Subcommand => 0,
            CallbackType::Exit => 1,
            CallbackType::Function => 2,
        }
    }
}

/// Either a lazy (library, procedure) reference resolved at call time, or an
/// entry point already resolved inside some registering process.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Binding {
    Library { library: String, procedure: String },
    EntryPoint(u64),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RegistrationEntry {
    pub binding: Binding,
    pub user_data: Vec<u8>,
    pub drop_authority: bool,
}

impl RegistrationEntry {
    /// Payload layout: mode u8, drop-authority u8, user-data length u16,
    /// then the binding fields, then the user data.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        if self.user_data.len() > MAX_USER_DATA {
            return Err(Error::new(ErrorKind::BadArgument).with_message("user data exceeds max"));
        }
        let mut buf = Vec::new();
        match &self.binding {
            Binding::Library { library, procedure } => {
                if library.len() > u16::MAX as usize || procedure.len() > u16::MAX as usize {
                    return Err(
                        Error::new(ErrorKind::BadArgument).with_message("binding name too long")
                    );
                }
                buf.push(0u8);
                buf.push(u8::from(self.drop_authority));
                buf.extend_from_slice(&(self.user_data.len() as u16).to_le_bytes());
                buf.extend_from_slice(&(library.len() as u16).to_le_bytes());
                buf.extend_from_slice(&(procedure.len() as u16).to_le_bytes());
                buf.extend_from_slice(library.as_bytes());
                buf.extend_from_slice(procedure.as_bytes());
            }
            Binding::EntryPoint(entry) => {
                buf.push(1u8);
                buf.push(u8::from(self.drop_authority));
                buf.extend_from_slice(&(self.user_data.len() as u16).to_le_bytes());
                buf.extend_from_slice(&entry.to_le_bytes());
            }
        }
        buf.extend_from_slice(&self.user_data);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let mut reader = SliceReader::new(buf);
        let mode = reader.take_u8()?;
        let drop_authority = reader.take_u8()? != 0;
        let user_data_len = reader.take_u16()? as usize;
        if user_data_len > MAX_USER_DATA {
            return Err(Error::new(ErrorKind::Protocol).with_message("user data exceeds max"));
        }
        let binding = match mode {
            0 => {
                let library_len = reader.take_u16()? as usize;
                let procedure_len = reader.take_u16()? as usize;
                let library = reader.take_str(library_len)?;
                let procedure = reader.take_str(procedure_len)?;
                Binding::Library { library, procedure }
            }
            1 => Binding::EntryPoint(reader.take_u64()?),
            _ => {
                return Err(Error::new(ErrorKind::Protocol).with_message("unknown binding mode"));
            }
        };
        let user_data = reader.take_bytes(user_data_len)?;
        reader.expect_end()?;
        Ok(Self {
            binding,
            user_data,
            drop_authority,
        })
    }
}

struct SliceReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SliceReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| Error::new(ErrorKind::Protocol).with_message("truncated payload"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16, Error> {
        let slice = self.take(2)?;
        Ok(u16::from_le_bytes([slice[0], slice[1]]))
    }

    fn take_u64(&mut self) -> Result<u64, Error> {
        let slice = self.take(8)?;
        let mut out = [0u8; 8];
        out.copy_from_slice(slice);
        Ok(u64::from_le_bytes(out))
    }

    fn take_str(&mut self, len: usize) -> Result<String, Error> {
        let slice = self.take(len)?;
        std::str::from_utf8(slice)
            .map(str::to_string)
            .map_err(|_| Error::new(ErrorKind::Protocol).with_message("payload text not UTF-8"))
    }

    fn take_bytes(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        Ok(self.take(len)?.to_vec())
    }

    fn expect_end(&self) -> Result<(), Error> {
        if self.pos != self.buf.len() {
            return Err(Error::new(ErrorKind::Protocol).with_message("trailing payload bytes"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Binding, CallbackType, InsertOrder, RegistrationEntry};
    use crate::core::error::ErrorKind;

    #[test]
    fn library_entry_round_trip() {
        let entry = RegistrationEntry {
            binding: Binding::Library {
                library: "mylib".to_string(),
                procedure: "MyProc".to_string(),
            },
            user_data: b"ud".to_vec(),
            drop_authority: true,
        };
        let buf = entry.encode().expect("encode");
        assert_eq!(RegistrationEntry::decode(&buf).expect("decode"), entry);
    }

    #[test]
    fn entry_point_round_trip() {
        let entry = RegistrationEntry {
            binding: Binding::EntryPoint(0xDEAD_BEEF),
            user_data: Vec::new(),
            drop_authority: false,
        };
        let buf = entry.encode().expect("encode");
        assert_eq!(RegistrationEntry::decode(&buf).expect("decode"), entry);
    }

    #[test]
    fn truncated_entry_is_a_protocol_error() {
        let entry = RegistrationEntry {
            binding: Binding::EntryPoint(1),
            user_data: b"xyz".to_vec(),
            drop_authority: true,
        };
        let buf = entry.encode().expect("encode");
        let err = RegistrationEntry::decode(&buf[..buf.len() - 1]).expect_err("truncated");
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let entry = RegistrationEntry {
            binding: Binding::EntryPoint(1),
            user_data: Vec::new(),
            drop_authority: false,
        };
        let mut buf = entry.encode().expect("encode");
        buf.push(0);
        let err = RegistrationEntry::decode(&buf).expect_err("trailing");
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn enums_round_trip_through_wire_words() {
        for order in [InsertOrder::Fifo, InsertOrder::Lifo] {
            assert_eq!(InsertOrder::from_u64(order.as_u64()).expect("order"), order);
        }
        for kind in [
            CallbackType::Subcommand,
            CallbackType::Exit,
            CallbackType::Function,
        ] {
            assert_eq!(CallbackType::from_u64(kind.as_u64()).expect("kind"), kind);
        }
        assert!(InsertOrder::from_u64(2).is_err());
        assert!(CallbackType::from_u64(3).is_err());
    }
}
