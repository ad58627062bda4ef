//! PyTorch checkpoints (`.pth`)
//!
//! `torch.save` writes a zip archive holding `<root>/data.pkl`, a pickle of
//! the state dict, and one `<root>/data/<key>` entry per tensor storage. The
//! pickle refers to storages through persistent ids. Only the opcodes
//! `torch.save` emits for a dict of tensors are understood, and only the
//! globals needed to rebuild tensors are resolved, so loading never runs code.
//!
//! The archive format is the one written by torch 1.6 and later. Legacy
//! non-zip checkpoints are rejected.

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::rc::Rc;

use half::{bf16, f16};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::checkpoint::{RawTensor, StateDict};
use crate::error::{Error, Result};
use crate::ir::Anime4kCnn;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const ARCHIVE_ROOT: &str = "archive";
const PICKLE_PROTOCOL: u8 = 2;

mod op {
    pub const PROTO: u8 = 0x80;
    pub const FRAME: u8 = 0x95;
    pub const STOP: u8 = b'.';
    pub const MARK: u8 = b'(';
    pub const POP: u8 = b'0';
    pub const POP_MARK: u8 = b'1';
    pub const DUP: u8 = b'2';
    pub const NONE: u8 = b'N';
    pub const NEWTRUE: u8 = 0x88;
    pub const NEWFALSE: u8 = 0x89;
    pub const BININT: u8 = b'J';
    pub const BININT1: u8 = b'K';
    pub const BININT2: u8 = b'M';
    pub const LONG1: u8 = 0x8a;
    pub const BINFLOAT: u8 = b'G';
    pub const SHORT_BINUNICODE: u8 = 0x8c;
    pub const BINUNICODE: u8 = b'X';
    pub const BINUNICODE8: u8 = 0x8d;
    pub const SHORT_BINSTRING: u8 = b'U';
    pub const BINSTRING: u8 = b'T';
    pub const SHORT_BINBYTES: u8 = b'C';
    pub const BINBYTES: u8 = b'B';
    pub const EMPTY_DICT: u8 = b'}';
    pub const EMPTY_LIST: u8 = b']';
    pub const EMPTY_TUPLE: u8 = b')';
    pub const DICT: u8 = b'd';
    pub const LIST: u8 = b'l';
    pub const TUPLE: u8 = b't';
    pub const TUPLE1: u8 = 0x85;
    pub const TUPLE2: u8 = 0x86;
    pub const TUPLE3: u8 = 0x87;
    pub const SETITEM: u8 = b's';
    pub const SETITEMS: u8 = b'u';
    pub const APPEND: u8 = b'a';
    pub const APPENDS: u8 = b'e';
    pub const GLOBAL: u8 = b'c';
    pub const STACK_GLOBAL: u8 = 0x93;
    pub const REDUCE: u8 = b'R';
    pub const NEWOBJ: u8 = 0x81;
    pub const BUILD: u8 = b'b';
    pub const BINPERSID: u8 = b'Q';
    pub const BINPUT: u8 = b'q';
    pub const LONG_BINPUT: u8 = b'r';
    pub const MEMOIZE: u8 = 0x94;
    pub const BINGET: u8 = b'h';
    pub const LONG_BINGET: u8 = b'j';
}

/// Element type of a tensor storage, from its `torch.*Storage` class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StorageType {
    Float,
    Half,
    BFloat16,
    Double,
}

impl StorageType {
    fn from_class(name: &str) -> Option<Self> {
        match name {
            "FloatStorage" => Some(Self::Float),
            "HalfStorage" => Some(Self::Half),
            "BFloat16Storage" => Some(Self::BFloat16),
            "DoubleStorage" => Some(Self::Double),
            _ => None,
        }
    }

    fn decode(self, bytes: &[u8]) -> Vec<f32> {
        match self {
            Self::Float => bytemuck::pod_collect_to_vec::<u8, f32>(bytes),
            Self::Half => bytemuck::pod_collect_to_vec::<u8, f16>(bytes).into_iter().map(f16::to_f32).collect(),
            Self::BFloat16 => bytemuck::pod_collect_to_vec::<u8, bf16>(bytes).into_iter().map(bf16::to_f32).collect(),
            Self::Double => bytemuck::pod_collect_to_vec::<u8, f64>(bytes).into_iter().map(|v| v as f32).collect(),
        }
    }
}

/// Values on the unpickler stack
#[derive(Debug, Clone)]
enum Value {
    Mark,
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Global { module: String, name: String },
    Storage(Rc<Vec<f32>>),
    Tensor(Rc<RawTensor>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Mark => "mark",
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Global { .. } => "global",
            Value::Storage(_) => "storage",
            Value::Tensor(_) => "tensor",
        }
    }

    /// Short rendering for log lines
    fn describe(&self) -> String {
        match self {
            Value::Bool(v) => v.to_string(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Str(v) => format!("{v:?}"),
            Value::Bytes(v) => format!("{} bytes", v.len()),
            other => other.kind().to_string(),
        }
    }

    fn into_items(self) -> Result<Vec<Value>> {
        match self {
            Value::Tuple(items) | Value::List(items) => Ok(items),
            other => Err(pickle_error(format!("expected a tuple, found {}", other.kind()))),
        }
    }

    fn as_usize(&self) -> Result<usize> {
        match self {
            Value::Int(v) => usize::try_from(*v).map_err(|_| pickle_error(format!("{v} is not a valid size"))),
            other => Err(pickle_error(format!("expected an int, found {}", other.kind()))),
        }
    }

    fn as_str(&self) -> Result<&str> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(pickle_error(format!("expected a str, found {}", other.kind()))),
        }
    }
}

fn pickle_error(message: impl Into<String>) -> Error {
    Error::Pickle(message.into())
}

/// Loads storages on demand from the archive's `data/` directory
trait StorageLoader {
    fn load(&mut self, key: &str, storage: StorageType) -> Result<Rc<Vec<f32>>>;
}

struct ArchiveStorages<'a, 'b> {
    archive: &'a mut ZipArchive<Cursor<&'b [u8]>>,
    root: String,
    cache: HashMap<String, Rc<Vec<f32>>>,
}

impl StorageLoader for ArchiveStorages<'_, '_> {
    fn load(&mut self, key: &str, storage: StorageType) -> Result<Rc<Vec<f32>>> {
        if let Some(data) = self.cache.get(key) {
            return Ok(Rc::clone(data));
        }
        let mut entry = self.archive.by_name(&format!("{}/data/{key}", self.root))?;
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes).map_err(|e| pickle_error(format!("storage '{key}': {e}")))?;
        let data = Rc::new(storage.decode(&bytes));
        debug!("Loaded storage '{key}' ({} elements)", data.len());
        self.cache.insert(key.to_string(), Rc::clone(&data));
        Ok(data)
    }
}

/// A stack machine over the subset of pickle used by `torch.save`
struct Unpickler<'a, L> {
    bytes: &'a [u8],
    position: usize,
    stack: Vec<Value>,
    memo: HashMap<u32, Value>,
    storages: L,
}

impl<'a, L: StorageLoader> Unpickler<'a, L> {
    fn new(bytes: &'a [u8], storages: L) -> Self {
        Self {
            bytes,
            position: 0,
            stack: Vec::new(),
            memo: HashMap::new(),
            storages,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let bytes = self.bytes;
        let end = self.position.checked_add(n).filter(|end| *end <= bytes.len()).ok_or_else(|| pickle_error("truncated pickle stream"))?;
        let slice = &bytes[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut array = [0; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    fn take_line(&mut self) -> Result<String> {
        let bytes = self.bytes;
        let rest = &bytes[self.position..];
        let len = rest.iter().position(|b| *b == b'\n').ok_or_else(|| pickle_error("unterminated GLOBAL operand"))?;
        let line = self.take(len + 1)?;
        Ok(String::from_utf8_lossy(&line[..len]).into_owned())
    }

    fn take_str(&mut self, len: usize) -> Result<String> {
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| pickle_error(format!("invalid UTF-8 string: {e}")))
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or_else(|| pickle_error("stack underflow"))
    }

    fn top(&mut self) -> Result<&mut Value> {
        self.stack.last_mut().ok_or_else(|| pickle_error("stack underflow"))
    }

    fn pop_mark(&mut self) -> Result<Vec<Value>> {
        let mark = self.stack.iter().rposition(|v| matches!(v, Value::Mark)).ok_or_else(|| pickle_error("MARK not found"))?;
        let items = self.stack.split_off(mark + 1);
        self.stack.pop();
        Ok(items)
    }

    fn memo_get(&self, index: u32) -> Result<Value> {
        self.memo.get(&index).cloned().ok_or_else(|| pickle_error(format!("memo slot {index} is empty")))
    }

    fn set_items(&mut self, items: Vec<Value>) -> Result<()> {
        if items.len() % 2 != 0 {
            return Err(pickle_error("SETITEMS with an odd number of values"));
        }
        let Value::Dict(entries) = self.top()? else {
            return Err(pickle_error("SETITEMS target is not a dict"));
        };
        let mut items = items.into_iter();
        while let (Some(key), Some(value)) = (items.next(), items.next()) {
            entries.push((key, value));
        }
        Ok(())
    }

    fn append(&mut self, items: Vec<Value>) -> Result<()> {
        match self.top()? {
            Value::List(list) => {
                list.extend(items);
                Ok(())
            }
            other => Err(pickle_error(format!("APPEND target is a {}", other.kind()))),
        }
    }

    /// Calls one of the allowed globals
    fn call(&mut self, callable: Value, args: Value) -> Result<Value> {
        let Value::Global { module, name } = callable else {
            return Err(pickle_error(format!("cannot call a {}", callable.kind())));
        };
        match (module.as_str(), name.as_str()) {
            ("collections", "OrderedDict") | ("builtins", "dict") => Ok(Value::Dict(Vec::new())),
            ("torch._utils", "_rebuild_tensor_v2" | "_rebuild_tensor") => rebuild_tensor(args.into_items()?),
            ("torch._utils", "_rebuild_parameter") => {
                let mut args = args.into_items()?.into_iter();
                match args.next() {
                    Some(tensor @ Value::Tensor(_)) => Ok(tensor),
                    _ => Err(pickle_error("_rebuild_parameter without a tensor")),
                }
            }
            _ => Err(pickle_error(format!("refusing to call {module}.{name}"))),
        }
    }

    /// Resolves a `('storage', type, key, location, numel)` persistent id
    fn persistent_load(&mut self, pid: Value) -> Result<Value> {
        let items = pid.into_items()?;
        let [tag, class, key, ..] = items.as_slice() else {
            return Err(pickle_error("persistent id is too short"));
        };
        if tag.as_str()? != "storage" {
            return Err(pickle_error(format!("unknown persistent id '{}'", tag.as_str()?)));
        }
        let Value::Global { module, name } = class else {
            return Err(pickle_error("storage type is not a global"));
        };
        let storage = match (module.as_str(), StorageType::from_class(name)) {
            ("torch", Some(storage)) => storage,
            _ => {
                return Err(Error::UnsupportedDtype {
                    name: key.as_str()?.to_string(),
                    dtype: format!("{module}.{name}"),
                });
            }
        };
        Ok(Value::Storage(self.storages.load(key.as_str()?, storage)?))
    }

    fn run(mut self) -> Result<Value> {
        loop {
            let [opcode] = self.take_array::<1>()?;
            match opcode {
                op::PROTO => {
                    self.take(1)?;
                }
                op::FRAME => {
                    self.take(8)?;
                }
                op::STOP => return self.pop(),
                op::MARK => self.stack.push(Value::Mark),
                op::POP => {
                    self.pop()?;
                }
                op::POP_MARK => {
                    self.pop_mark()?;
                }
                op::DUP => {
                    let top = self.top()?.clone();
                    self.stack.push(top);
                }
                op::NONE => self.stack.push(Value::None),
                op::NEWTRUE => self.stack.push(Value::Bool(true)),
                op::NEWFALSE => self.stack.push(Value::Bool(false)),
                op::BININT => {
                    let v = i32::from_le_bytes(self.take_array()?);
                    self.stack.push(Value::Int(v.into()));
                }
                op::BININT1 => {
                    let [v] = self.take_array::<1>()?;
                    self.stack.push(Value::Int(v.into()));
                }
                op::BININT2 => {
                    let v = u16::from_le_bytes(self.take_array()?);
                    self.stack.push(Value::Int(v.into()));
                }
                op::LONG1 => {
                    let [len] = self.take_array::<1>()?;
                    let digits = self.take(len.into())?;
                    if digits.len() > 8 {
                        return Err(pickle_error("integer does not fit in 64 bits"));
                    }
                    // little-endian two's complement, sign-extended
                    let fill = if digits.last().is_some_and(|b| b & 0x80 != 0) { 0xff } else { 0 };
                    let mut buf = [fill; 8];
                    buf[..digits.len()].copy_from_slice(digits);
                    self.stack.push(Value::Int(i64::from_le_bytes(buf)));
                }
                op::BINFLOAT => {
                    let v = f64::from_be_bytes(self.take_array()?);
                    self.stack.push(Value::Float(v));
                }
                op::SHORT_BINUNICODE | op::SHORT_BINSTRING => {
                    let [len] = self.take_array::<1>()?;
                    let s = self.take_str(len.into())?;
                    self.stack.push(Value::Str(s));
                }
                op::BINUNICODE | op::BINSTRING => {
                    let len = u32::from_le_bytes(self.take_array()?) as usize;
                    let s = self.take_str(len)?;
                    self.stack.push(Value::Str(s));
                }
                op::BINUNICODE8 => {
                    let len = usize::try_from(u64::from_le_bytes(self.take_array()?)).map_err(|_| pickle_error("string too long"))?;
                    let s = self.take_str(len)?;
                    self.stack.push(Value::Str(s));
                }
                op::SHORT_BINBYTES => {
                    let [len] = self.take_array::<1>()?;
                    let bytes = self.take(len.into())?.to_vec();
                    self.stack.push(Value::Bytes(bytes));
                }
                op::BINBYTES => {
                    let len = u32::from_le_bytes(self.take_array()?) as usize;
                    let bytes = self.take(len)?.to_vec();
                    self.stack.push(Value::Bytes(bytes));
                }
                op::EMPTY_DICT => self.stack.push(Value::Dict(Vec::new())),
                op::EMPTY_LIST => self.stack.push(Value::List(Vec::new())),
                op::EMPTY_TUPLE => self.stack.push(Value::Tuple(Vec::new())),
                op::DICT => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::Dict(Vec::new()));
                    self.set_items(items)?;
                }
                op::LIST => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::List(items));
                }
                op::TUPLE => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::Tuple(items));
                }
                op::TUPLE1 | op::TUPLE2 | op::TUPLE3 => {
                    let n = usize::from(opcode - op::TUPLE1 + 1);
                    if self.stack.len() < n {
                        return Err(pickle_error("stack underflow"));
                    }
                    let items = self.stack.split_off(self.stack.len() - n);
                    self.stack.push(Value::Tuple(items));
                }
                op::SETITEM => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    self.set_items(vec![key, value])?;
                }
                op::SETITEMS => {
                    let items = self.pop_mark()?;
                    self.set_items(items)?;
                }
                op::APPEND => {
                    let value = self.pop()?;
                    self.append(vec![value])?;
                }
                op::APPENDS => {
                    let items = self.pop_mark()?;
                    self.append(items)?;
                }
                op::GLOBAL => {
                    let module = self.take_line()?;
                    let name = self.take_line()?;
                    self.stack.push(Value::Global { module, name });
                }
                op::STACK_GLOBAL => {
                    let name = self.pop()?.as_str()?.to_string();
                    let module = self.pop()?.as_str()?.to_string();
                    self.stack.push(Value::Global { module, name });
                }
                op::REDUCE | op::NEWOBJ => {
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    let value = self.call(callable, args)?;
                    self.stack.push(value);
                }
                op::BUILD => {
                    // instance state such as OrderedDict `_metadata` carries no tensors
                    self.pop()?;
                }
                op::BINPERSID => {
                    let pid = self.pop()?;
                    let value = self.persistent_load(pid)?;
                    self.stack.push(value);
                }
                op::BINPUT => {
                    let [index] = self.take_array::<1>()?;
                    let top = self.top()?.clone();
                    self.memo.insert(index.into(), top);
                }
                op::LONG_BINPUT => {
                    let index = u32::from_le_bytes(self.take_array()?);
                    let top = self.top()?.clone();
                    self.memo.insert(index, top);
                }
                op::MEMOIZE => {
                    let index = u32::try_from(self.memo.len()).map_err(|_| pickle_error("memo overflow"))?;
                    let top = self.top()?.clone();
                    self.memo.insert(index, top);
                }
                op::BINGET => {
                    let [index] = self.take_array::<1>()?;
                    let value = self.memo_get(index.into())?;
                    self.stack.push(value);
                }
                op::LONG_BINGET => {
                    let index = u32::from_le_bytes(self.take_array()?);
                    let value = self.memo_get(index)?;
                    self.stack.push(value);
                }
                other => return Err(pickle_error(format!("unsupported opcode 0x{other:02x} at byte {}", self.position - 1))),
            }
        }
    }
}

/// `_rebuild_tensor_v2(storage, offset, size, stride, ...)`
fn rebuild_tensor(args: Vec<Value>) -> Result<Value> {
    let [storage, offset, size, stride, ..] = args.as_slice() else {
        return Err(pickle_error("_rebuild_tensor_v2 takes at least 4 arguments"));
    };
    let Value::Storage(storage) = storage else {
        return Err(pickle_error(format!("tensor storage is a {}", storage.kind())));
    };
    let offset = offset.as_usize()?;
    let shape = size.clone().into_items()?.iter().map(Value::as_usize).collect::<Result<Vec<_>>>()?;
    let strides = stride.clone().into_items()?.iter().map(Value::as_usize).collect::<Result<Vec<_>>>()?;
    if shape.len() != strides.len() {
        return Err(pickle_error(format!("size {shape:?} and stride {strides:?} differ in rank")));
    }

    let numel: usize = shape.iter().product();
    let mut data = Vec::with_capacity(numel);
    let mut index = vec![0usize; shape.len()];
    for _ in 0..numel {
        let position = offset + index.iter().zip(&strides).map(|(i, s)| i * s).sum::<usize>();
        let value = storage.get(position).ok_or_else(|| pickle_error(format!("tensor element {position} is outside its storage of {}", storage.len())))?;
        data.push(*value);
        for axis in (0..index.len()).rev() {
            index[axis] += 1;
            if index[axis] < shape[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    Ok(Value::Tensor(Rc::new(RawTensor { shape, data })))
}

fn collect_tensors(prefix: &str, entries: Vec<(Value, Value)>, dict: &mut StateDict) -> Result<()> {
    for (key, value) in entries {
        let key = match key {
            Value::Str(key) => key,
            Value::Int(key) => key.to_string(),
            other => return Err(pickle_error(format!("state dict key is a {}", other.kind()))),
        };
        let name = if prefix.is_empty() { key } else { format!("{prefix}.{key}") };
        match value {
            Value::Tensor(tensor) => dict.insert(name, Rc::unwrap_or_clone(tensor)),
            Value::Dict(inner) => collect_tensors(&name, inner, dict)?,
            other => debug!("Skipping non-tensor entry '{name}' ({})", other.describe()),
        }
    }
    Ok(())
}

/// Decodes a `torch.save` archive into a flat state dict
///
/// Nested dicts are flattened with `.`-joined names, so a checkpoint nested
/// under `params_ema` yields `params_ema.conv_head.weight` and so on.
///
/// # Errors
/// Returns [`Error::Pickle`] for a legacy or malformed pickle, [`Error::Zip`]
/// for a damaged archive and [`Error::UnsupportedDtype`] for integer storages.
pub fn read_pth_state_dict(bytes: &[u8]) -> Result<StateDict> {
    if !bytes.starts_with(ZIP_MAGIC) {
        return Err(pickle_error("not a zip archive; legacy torch.save files must be re-saved with torch 1.6 or newer"));
    }
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let pickle_name = archive
        .file_names()
        .find(|name| name.ends_with("/data.pkl") && name.matches('/').count() == 1)
        .map(str::to_string)
        .ok_or_else(|| pickle_error("archive has no data.pkl"))?;
    let root = pickle_name.trim_end_matches("/data.pkl").to_string();
    debug!("Reading pickle '{pickle_name}'");

    let mut pickle = Vec::new();
    archive.by_name(&pickle_name)?.read_to_end(&mut pickle).map_err(|e| pickle_error(format!("{pickle_name}: {e}")))?;

    let storages = ArchiveStorages {
        archive: &mut archive,
        root,
        cache: HashMap::new(),
    };
    let Value::Dict(entries) = Unpickler::new(&pickle, storages).run()? else {
        return Err(Error::mismatch("pickled checkpoint is not a state dict mapping"));
    };

    let mut dict = StateDict::new();
    collect_tensors("", entries, &mut dict)?;
    Ok(dict)
}

/// Reads a model from a `torch.save` archive
pub fn read_pth(bytes: &[u8]) -> Result<Anime4kCnn> {
    read_pth_state_dict(bytes)?.unwrap_wrapper().to_model()
}

/// Pickle opcode emitter for a dict of contiguous float tensors
#[derive(Default)]
struct Pickler {
    out: Vec<u8>,
}

impl Pickler {
    fn str(&mut self, s: &str) {
        self.out.push(op::BINUNICODE);
        self.out.extend_from_slice(&(s.len() as u32).to_le_bytes());
        self.out.extend_from_slice(s.as_bytes());
    }

    fn int(&mut self, v: usize) {
        match (u8::try_from(v), u16::try_from(v), i32::try_from(v)) {
            (Ok(v), _, _) => self.out.extend_from_slice(&[op::BININT1, v]),
            (_, Ok(v), _) => {
                self.out.push(op::BININT2);
                self.out.extend_from_slice(&v.to_le_bytes());
            }
            (_, _, Ok(v)) => {
                self.out.push(op::BININT);
                self.out.extend_from_slice(&v.to_le_bytes());
            }
            _ => {
                self.out.extend_from_slice(&[op::LONG1, 8]);
                self.out.extend_from_slice(&(v as u64).to_le_bytes());
            }
        }
    }

    fn global(&mut self, module: &str, name: &str) {
        self.out.push(op::GLOBAL);
        self.out.extend_from_slice(format!("{module}\n{name}\n").as_bytes());
    }

    fn int_tuple(&mut self, values: &[usize]) {
        if values.is_empty() {
            self.out.push(op::EMPTY_TUPLE);
            return;
        }
        self.out.push(op::MARK);
        for &v in values {
            self.int(v);
        }
        self.out.push(op::TUPLE);
    }

    /// `_rebuild_tensor_v2(storage(key), 0, shape, contiguous strides, False, OrderedDict())`
    fn tensor(&mut self, key: &str, tensor: &RawTensor) {
        let mut strides = vec![1usize; tensor.shape.len()];
        for axis in (0..tensor.shape.len().saturating_sub(1)).rev() {
            strides[axis] = strides[axis + 1] * tensor.shape[axis + 1];
        }

        self.global("torch._utils", "_rebuild_tensor_v2");
        self.out.push(op::MARK);
        {
            self.out.push(op::MARK);
            self.str("storage");
            self.global("torch", "FloatStorage");
            self.str(key);
            self.str("cpu");
            self.int(tensor.data.len());
            self.out.push(op::TUPLE);
            self.out.push(op::BINPERSID);
        }
        self.int(0);
        self.int_tuple(&tensor.shape);
        self.int_tuple(&strides);
        self.out.push(op::NEWFALSE);
        self.global("collections", "OrderedDict");
        self.out.push(op::EMPTY_TUPLE);
        self.out.push(op::REDUCE);
        self.out.push(op::TUPLE);
        self.out.push(op::REDUCE);
    }
}

fn add_entry(writer: &mut ZipWriter<Cursor<Vec<u8>>>, name: &str, contents: &[u8]) -> Result<()> {
    writer.start_file(name, SimpleFileOptions::default().compression_method(CompressionMethod::Stored))?;
    writer.write_all(contents).map_err(zip::result::ZipError::Io)?;
    Ok(())
}

/// Serializes a model as a `torch.save` archive of float32 tensors
///
/// Storage keys are assigned in state-dict order. Entries are stored without
/// compression, as torch does.
///
/// # Errors
/// Returns [`Error::NonFinite`] or a shape error if the model is invalid, and
/// [`Error::Zip`] if the archive cannot be assembled.
pub fn write_pth(model: &Anime4kCnn) -> Result<Vec<u8>> {
    let dict = StateDict::from_model(model)?;

    let mut pickler = Pickler::default();
    pickler.out.extend_from_slice(&[op::PROTO, PICKLE_PROTOCOL, op::EMPTY_DICT, op::MARK]);
    for (key, name) in dict.keys().enumerate() {
        let Some(tensor) = dict.get(name) else { continue };
        pickler.str(name);
        pickler.tensor(&key.to_string(), tensor);
    }
    pickler.out.extend_from_slice(&[op::SETITEMS, op::STOP]);

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    add_entry(&mut writer, &format!("{ARCHIVE_ROOT}/data.pkl"), &pickler.out)?;
    add_entry(&mut writer, &format!("{ARCHIVE_ROOT}/byteorder"), b"little")?;
    for (key, name) in dict.keys().enumerate() {
        if let Some(tensor) = dict.get(name) {
            add_entry(&mut writer, &format!("{ARCHIVE_ROOT}/data/{key}"), bytemuck::cast_slice(&tensor.data))?;
        }
    }
    add_entry(&mut writer, &format!("{ARCHIVE_ROOT}/version"), b"3\n")?;

    Ok(writer.finish()?.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{arch, sample_model};

    /// Storages keyed by name, for pickles built without an archive
    struct MemoryStorages(HashMap<String, Vec<f32>>);

    impl StorageLoader for MemoryStorages {
        fn load(&mut self, key: &str, _storage: StorageType) -> Result<Rc<Vec<f32>>> {
            self.0.get(key).cloned().map(Rc::new).ok_or_else(|| pickle_error(format!("no storage '{key}'")))
        }
    }

    fn unpickle(bytes: &[u8], storages: &[(&str, Vec<f32>)]) -> Result<Value> {
        let storages = MemoryStorages(storages.iter().map(|(k, v)| (k.to_string(), v.clone())).collect());
        Unpickler::new(bytes, storages).run()
    }

    #[test]
    fn test_round_trip_is_bit_exact() {
        for arch in [arch(8, 5, 2, 3, 1), arch(4, 2, 1, 2, 3), arch(16, 1, 2, 1, 3)] {
            let model = sample_model(arch);
            let bytes = write_pth(&model).unwrap();
            assert!(bytes.starts_with(ZIP_MAGIC));
            assert_eq!(read_pth(&bytes).unwrap(), model);
            assert_eq!(read_pth_state_dict(&bytes).unwrap(), StateDict::from_model(&model).unwrap());
        }
    }

    #[test]
    fn test_archive_layout() {
        let model = sample_model(arch(4, 2, 2, 1, 1));
        let bytes = write_pth(&model).unwrap();
        let mut archive = ZipArchive::new(Cursor::new(bytes.as_slice())).unwrap();
        let names: Vec<String> = archive.file_names().map(str::to_string).collect();
        assert!(names.contains(&"archive/data.pkl".to_string()));
        assert!(names.contains(&"archive/version".to_string()));
        // head, one mid layer and tail: two tensors each
        assert_eq!(names.iter().filter(|n| n.starts_with("archive/data/")).count(), 6);
        let mut version = String::new();
        archive.by_name("archive/version").unwrap().read_to_string(&mut version).unwrap();
        assert_eq!(version, "3\n");
    }

    #[test]
    fn test_strided_views_and_memo() {
        // {'w': tensor of shape (2, 2) viewing storage '0' transposed from offset 1}
        let mut p = Pickler::default();
        p.out.extend_from_slice(&[op::PROTO, 2, op::EMPTY_DICT, op::BINPUT, 0, op::MARK]);
        p.out.extend_from_slice(&[op::SHORT_BINUNICODE, 1, b'w']);
        p.global("torch._utils", "_rebuild_tensor_v2");
        p.out.extend_from_slice(&[op::BINPUT, 1, op::MARK, op::MARK]);
        p.str("storage");
        p.global("torch", "FloatStorage");
        p.str("0");
        p.str("cpu");
        p.int(5);
        p.out.extend_from_slice(&[op::TUPLE, op::BINPERSID]);
        p.int(1);
        p.int(2);
        p.int(2);
        p.out.push(op::TUPLE2);
        p.int(1);
        p.int(2);
        p.out.push(op::TUPLE2);
        p.out.extend_from_slice(&[op::NEWFALSE, op::BINGET, 1, op::POP]);
        p.global("collections", "OrderedDict");
        p.out.extend_from_slice(&[op::EMPTY_TUPLE, op::REDUCE, op::TUPLE, op::REDUCE]);
        p.out.extend_from_slice(&[op::SETITEMS, op::STOP]);

        let Value::Dict(entries) = unpickle(&p.out, &[("0", vec![9.0, 1.0, 2.0, 3.0, 4.0])]).unwrap() else {
            panic!("expected a dict");
        };
        let mut dict = StateDict::new();
        collect_tensors("", entries, &mut dict).unwrap();
        let w = dict.get("w").unwrap();
        assert_eq!(w.shape, vec![2, 2]);
        assert_eq!(w.data, vec![1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn test_nested_wrapper_is_flattened() {
        let mut p = Pickler::default();
        p.out.extend_from_slice(&[op::PROTO, 2, op::EMPTY_DICT, op::MARK]);
        p.str("params_ema");
        p.global("collections", "OrderedDict");
        p.out.extend_from_slice(&[op::EMPTY_TUPLE, op::REDUCE, op::MARK]);
        p.str("conv_head.bias");
        p.tensor("0", &RawTensor { shape: vec![2], data: vec![0.5, -0.5] });
        p.out.push(op::SETITEMS);
        p.out.extend_from_slice(&[op::EMPTY_DICT, op::BUILD]);
        p.str("iter");
        p.int(400_000);
        p.out.extend_from_slice(&[op::SETITEMS, op::STOP]);

        let Value::Dict(entries) = unpickle(&p.out, &[("0", vec![0.5, -0.5])]).unwrap() else {
            panic!("expected a dict");
        };
        let mut dict = StateDict::new();
        collect_tensors("", entries, &mut dict).unwrap();
        assert_eq!(dict.keys().collect::<Vec<_>>(), vec!["params_ema.conv_head.bias"]);
        let dict = dict.unwrap_wrapper();
        assert_eq!(dict.get("conv_head.bias").unwrap().data, vec![0.5, -0.5]);
    }

    #[test]
    fn test_large_integers() {
        let mut p = Pickler::default();
        p.int(70_000);
        p.int(5_000_000_000);
        p.out.extend_from_slice(&[op::TUPLE2, op::STOP]);
        let items = unpickle(&p.out, &[]).unwrap().into_items().unwrap();
        assert_eq!(items[0].as_usize().unwrap(), 70_000);
        assert_eq!(items[1].as_usize().unwrap(), 5_000_000_000);
        assert!(matches!(unpickle(&[op::LONG1, 1, 0xff, op::STOP], &[]).unwrap(), Value::Int(-1)));
    }

    #[test]
    fn test_rejects_code_execution_and_legacy_files() {
        let mut p = Pickler::default();
        p.global("os", "system");
        p.str("echo");
        p.out.extend_from_slice(&[op::TUPLE1, op::REDUCE, op::STOP]);
        assert!(matches!(unpickle(&p.out, &[]), Err(Error::Pickle(message)) if message.contains("os.system")));

        assert!(matches!(read_pth(&[op::PROTO, 2, op::EMPTY_DICT, op::STOP]), Err(Error::Pickle(_))));
        assert!(matches!(unpickle(&[op::PROTO, 2, op::EMPTY_DICT], &[]), Err(Error::Pickle(_))));
    }

    #[test]
    fn test_integer_storage_is_unsupported() {
        let mut p = Pickler::default();
        p.out.push(op::MARK);
        p.str("storage");
        p.global("torch", "LongStorage");
        p.str("0");
        p.str("cpu");
        p.int(1);
        p.out.extend_from_slice(&[op::TUPLE, op::BINPERSID, op::STOP]);
        assert!(matches!(unpickle(&p.out, &[("0", vec![0.0])]), Err(Error::UnsupportedDtype { dtype, .. }) if dtype == "torch.LongStorage"));
    }
}
