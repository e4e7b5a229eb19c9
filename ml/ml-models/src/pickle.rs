//! Minimal writer for PyTorch zip checkpoints.
//!
//! Emits the protocol 2 pickle `torch.save` produces for a (possibly nested)
//! dict of contiguous CPU tensors and integers, plus one raw little-endian
//! storage file per tensor.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use burn::tensor::DType;
use zip::CompressionMethod;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::error::{ModelError, Result};
use crate::param::Param;

const PROTO: u8 = 0x80;
const EMPTY_DICT: u8 = b'}';
const EMPTY_TUPLE: u8 = b')';
const MARK: u8 = b'(';
const SETITEMS: u8 = b'u';
const TUPLE: u8 = b't';
const BINUNICODE: u8 = b'X';
const GLOBAL: u8 = b'c';
const BINPERSID: u8 = b'Q';
const BININT: u8 = b'J';
const BININT1: u8 = b'K';
const LONG1: u8 = 0x8a;
const NEWFALSE: u8 = 0x89;
const REDUCE: u8 = b'R';
const STOP: u8 = b'.';

/// Archive root directory, as written by `torch.save`.
const ARCHIVE: &str = "archive";

/// A value stored in a checkpoint pickle.
#[derive(Debug)]
pub(crate) enum Node<'a> {
    /// String-keyed dict, written in the given order.
    Dict(Vec<(String, Node<'a>)>),
    /// Contiguous tensor.
    Tensor(&'a Param),
    /// Python int.
    Int(i64),
}

#[derive(Default)]
struct Pickler {
    out: Vec<u8>,
    storages: Vec<Vec<u8>>,
}

impl Pickler {
    fn value(&mut self, node: &Node<'_>) -> Result<()> {
        match node {
            Node::Dict(entries) => {
                self.out.push(EMPTY_DICT);
                if entries.is_empty() {
                    return Ok(());
                }
                self.out.push(MARK);
                for (key, value) in entries {
                    self.unicode(key);
                    self.value(value)?;
                }
                self.out.push(SETITEMS);
            }
            Node::Tensor(param) => self.tensor(param)?,
            Node::Int(v) => self.int(*v),
        }
        Ok(())
    }

    fn tensor(&mut self, param: &Param) -> Result<()> {
        let (class, bytes) = match param.dtype() {
            DType::F32 => (
                "FloatStorage",
                param.as_f32()?.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>(),
            ),
            DType::I64 => (
                "LongStorage",
                param.as_i64()?.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>(),
            ),
            other => {
                return Err(ModelError::unsupported_format(format!(
                    "cannot pickle {other:?} tensors"
                )));
            }
        };
        let key = self.storages.len().to_string();
        self.storages.push(bytes);

        self.global("torch._utils", "_rebuild_tensor_v2");
        self.out.push(MARK);
        // Persistent id: ("storage", class, key, location, numel).
        self.out.push(MARK);
        self.unicode("storage");
        self.global("torch", class);
        self.unicode(&key);
        self.unicode("cpu");
        self.usize(param.numel());
        self.out.push(TUPLE);
        self.out.push(BINPERSID);
        self.int(0);
        self.usize_tuple(param.shape());
        self.usize_tuple(&contiguous_strides(param.shape()));
        self.out.push(NEWFALSE);
        self.out.push(EMPTY_DICT);
        self.out.push(TUPLE);
        self.out.push(REDUCE);
        Ok(())
    }

    fn unicode(&mut self, s: &str) {
        self.out.push(BINUNICODE);
        // Keys and names are far below 4 GiB.
        #[allow(clippy::cast_possible_truncation)]
        self.out.extend((s.len() as u32).to_le_bytes());
        self.out.extend(s.as_bytes());
    }

    fn global(&mut self, module: &str, name: &str) {
        self.out.push(GLOBAL);
        self.out.extend(format!("{module}\n{name}\n").as_bytes());
    }

    fn int(&mut self, v: i64) {
        if let Ok(byte) = u8::try_from(v) {
            self.out.extend([BININT1, byte]);
        } else if let Ok(word) = i32::try_from(v) {
            self.out.push(BININT);
            self.out.extend(word.to_le_bytes());
        } else {
            self.out.extend([LONG1, 8]);
            self.out.extend(v.to_le_bytes());
        }
    }

    fn usize(&mut self, v: usize) {
        self.int(i64::try_from(v).unwrap_or(i64::MAX));
    }

    fn usize_tuple(&mut self, values: &[usize]) {
        if values.is_empty() {
            self.out.push(EMPTY_TUPLE);
            return;
        }
        self.out.push(MARK);
        for &v in values {
            self.usize(v);
        }
        self.out.push(TUPLE);
    }
}

fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Writes `root` as a PyTorch zip checkpoint at `path`.
pub(crate) fn write_archive(path: &Path, root: &Node<'_>) -> Result<()> {
    let mut pickler = Pickler::default();
    pickler.out.extend([PROTO, 2]);
    pickler.value(root)?;
    pickler.out.push(STOP);

    let fail = |e: &dyn std::fmt::Display| {
        ModelError::save_checkpoint(path.display().to_string(), e.to_string())
    };
    let file = File::create(path).map_err(|e| fail(&e))?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    let mut entries: Vec<(String, &[u8])> = vec![
        (format!("{ARCHIVE}/data.pkl"), pickler.out.as_slice()),
        (format!("{ARCHIVE}/byteorder"), b"little".as_slice()),
        (format!("{ARCHIVE}/version"), b"3\n".as_slice()),
    ];
    for (i, storage) in pickler.storages.iter().enumerate() {
        entries.push((format!("{ARCHIVE}/data/{i}"), storage.as_slice()));
    }
    for (name, bytes) in entries {
        zip.start_file(name, options).map_err(|e| fail(&e))?;
        zip.write_all(bytes).map_err(|e| fail(&e))?;
    }
    zip.finish().map_err(|e| fail(&e))?;
    Ok(())
}
