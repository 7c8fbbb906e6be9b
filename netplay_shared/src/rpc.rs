//! RPC registry and dispatch model.
//!
//! Entries are keyed by the `(address, class_name, function_name)` triple in
//! a flat hash map. Arguments travel as an untagged sequence of `Value`s and
//! are decoded against the receiving entry's declared `ParamKind` schema.
//!
//! Routing rules per `DispatchKind`:
//! - `ServerOnly`: executes only inside a session host.
//! - `ClientOnly`: executes only inside a session peer.
//! - `ServerAndClient`: executes on the receiver; a host additionally relays
//!   it to every other validated peer after running it locally.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{archive::Archive, error::NetError, packet::Packet};

/// Where an RPC executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DispatchKind {
    ServerOnly,
    ClientOnly,
    ServerAndClient,
}

impl DispatchKind {
    pub fn runs_on_server(&self) -> bool {
        matches!(self, DispatchKind::ServerOnly | DispatchKind::ServerAndClient)
    }

    pub fn runs_on_client(&self) -> bool {
        matches!(self, DispatchKind::ClientOnly | DispatchKind::ServerAndClient)
    }
}

/// One decoded RPC argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Struct(Vec<Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Schema this value would satisfy.
    pub fn kind(&self) -> ParamKind {
        match self {
            Value::Bool(_) => ParamKind::Bool,
            Value::Int(_) => ParamKind::Int,
            Value::Float(_) => ParamKind::Float,
            Value::Str(_) => ParamKind::Str,
            Value::Struct(fields) => ParamKind::Struct(fields.iter().map(Value::kind).collect()),
        }
    }
}

/// Declared type of one RPC parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamKind {
    Bool,
    Int,
    Float,
    Str,
    Struct(Vec<ParamKind>),
}

impl ParamKind {
    fn name(&self) -> &'static str {
        match self {
            ParamKind::Bool => "bool",
            ParamKind::Int => "int",
            ParamKind::Float => "float",
            ParamKind::Str => "string",
            ParamKind::Struct(_) => "struct",
        }
    }
}

/// Encodes arguments without tags, in order.
pub fn encode_args(args: &[Value]) -> Bytes {
    let mut ar = Archive::new();
    for v in args {
        write_value(&mut ar, v);
    }
    ar.into_bytes()
}

fn write_value(ar: &mut Archive, v: &Value) {
    match v {
        Value::Bool(b) => {
            ar.write(b);
        }
        Value::Int(i) => {
            ar.write(i);
        }
        Value::Float(f) => {
            ar.write(f);
        }
        Value::Str(s) => {
            ar.write(s);
        }
        Value::Struct(fields) => {
            for f in fields {
                write_value(ar, f);
            }
        }
    }
}

/// Decodes `data` against `schema`, appending to `out`.
pub fn decode_args_into(
    schema: &[ParamKind],
    data: &[u8],
    out: &mut Vec<Value>,
) -> Result<(), NetError> {
    let mut ar = Archive::from_slice(data);
    for (index, kind) in schema.iter().enumerate() {
        let v = read_value(&mut ar, kind).map_err(|e| match e {
            NetError::Truncated { .. } | NetError::InvalidUtf8 => NetError::SchemaMismatch {
                index,
                expected: kind.name(),
            },
            other => other,
        })?;
        out.push(v);
    }
    match ar.remaining() {
        0 => Ok(()),
        n => Err(NetError::TrailingBytes(n)),
    }
}

pub fn decode_args(schema: &[ParamKind], data: &[u8]) -> Result<Vec<Value>, NetError> {
    let mut out = Vec::with_capacity(schema.len());
    decode_args_into(schema, data, &mut out)?;
    Ok(out)
}

fn read_value(ar: &mut Archive, kind: &ParamKind) -> Result<Value, NetError> {
    Ok(match kind {
        ParamKind::Bool => Value::Bool(ar.read()?),
        ParamKind::Int => Value::Int(ar.read()?),
        ParamKind::Float => Value::Float(ar.read()?),
        ParamKind::Str => Value::Str(ar.read()?),
        ParamKind::Struct(fields) => Value::Struct(
            fields
                .iter()
                .map(|f| read_value(ar, f))
                .collect::<Result<_, _>>()?,
        ),
    })
}

/// Information about the packet that triggered an invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcContext {
    /// Player index of the sender, `None` when the call came from the server.
    pub sender: Option<u32>,
    pub timestamp: u64,
}

pub type RpcCallback = Arc<dyn Fn(&RpcContext, &[Value]) + Send + Sync>;

/// Stable identity of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RpcKey {
    pub address: String,
    pub class_name: String,
    pub function_name: String,
}

impl RpcKey {
    pub fn new(
        address: impl Into<String>,
        class_name: impl Into<String>,
        function_name: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            class_name: class_name.into(),
            function_name: function_name.into(),
        }
    }

    pub fn of(packet: &Packet) -> Self {
        Self::new(
            packet.address.clone(),
            packet.class_name.clone(),
            packet.function_name.clone(),
        )
    }
}

impl fmt::Display for RpcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{}::{}",
            self.address, self.class_name, self.function_name
        )
    }
}

/// A registered RPC.
pub struct RpcEntry {
    pub function_name: String,
    pub kind: DispatchKind,
    /// Default reliability for outbound calls.
    pub reliable: bool,
    /// Prepend the packet timestamp as an implicit first `Value::Int`.
    pub requires_timestamp: bool,
    pub schema: Vec<ParamKind>,
    callback: Option<RpcCallback>,
    /// Decoded-argument buffer; receive and dispatch may run on different threads.
    params: Mutex<Vec<Value>>,
}

impl fmt::Debug for RpcEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcEntry")
            .field("function_name", &self.function_name)
            .field("kind", &self.kind)
            .field("reliable", &self.reliable)
            .field("requires_timestamp", &self.requires_timestamp)
            .field("schema", &self.schema)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl RpcEntry {
    /// An entry that executes `callback` when invoked locally.
    pub fn new<F>(
        function_name: impl Into<String>,
        kind: DispatchKind,
        schema: Vec<ParamKind>,
        callback: F,
    ) -> Self
    where
        F: Fn(&RpcContext, &[Value]) + Send + Sync + 'static,
    {
        Self {
            function_name: function_name.into(),
            kind,
            reliable: true,
            requires_timestamp: false,
            schema,
            callback: Some(Arc::new(callback)),
            params: Mutex::new(Vec::new()),
        }
    }

    /// A routing-only declaration: the local side knows how to send the
    /// call but never runs it.
    pub fn declare(function_name: impl Into<String>, kind: DispatchKind, schema: Vec<ParamKind>) -> Self {
        Self {
            function_name: function_name.into(),
            kind,
            reliable: true,
            requires_timestamp: false,
            schema,
            callback: None,
            params: Mutex::new(Vec::new()),
        }
    }

    pub fn unreliable(mut self) -> Self {
        self.reliable = false;
        self
    }

    pub fn with_timestamp(mut self) -> Self {
        self.requires_timestamp = true;
        self
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Checks outbound arguments against the schema before they hit the wire.
    pub fn check_args(&self, args: &[Value]) -> Result<(), NetError> {
        if args.len() != self.schema.len() {
            return Err(NetError::SchemaMismatch {
                index: args.len().min(self.schema.len()),
                expected: "argument count",
            });
        }
        for (index, (arg, kind)) in args.iter().zip(&self.schema).enumerate() {
            if arg.kind() != *kind {
                return Err(NetError::SchemaMismatch {
                    index,
                    expected: kind.name(),
                });
            }
        }
        Ok(())
    }
}

/// Flat triple-keyed registry with a capacity bound on distinct triples.
pub struct RpcRegistry {
    entries: HashMap<RpcKey, Arc<RpcEntry>>,
    capacity: usize,
}

impl Default for RpcRegistry {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl RpcRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
        }
    }

    /// Registers or replaces the entry for its triple. Returns the replaced entry.
    pub fn register(
        &mut self,
        address: impl Into<String>,
        class_name: impl Into<String>,
        entry: RpcEntry,
    ) -> Result<Option<Arc<RpcEntry>>, NetError> {
        let key = RpcKey::new(address, class_name, entry.function_name.clone());
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            return Err(NetError::RegistryFull(self.capacity));
        }
        tracing::debug!(rpc = %key, kind = ?entry.kind, "Registered rpc");
        Ok(self.entries.insert(key, Arc::new(entry)))
    }

    /// Removes every entry under `address`.
    pub fn unregister_address(&mut self, address: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|k, _| k.address != address);
        before - self.entries.len()
    }

    /// Removes every entry under `address`/`class_name`.
    pub fn unregister_class(&mut self, address: &str, class_name: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|k, _| !(k.address == address && k.class_name == class_name));
        before - self.entries.len()
    }

    /// Removes a single triple.
    pub fn unregister(&mut self, address: &str, class_name: &str, function_name: &str) -> usize {
        usize::from(
            self.entries
                .remove(&RpcKey::new(address, class_name, function_name))
                .is_some(),
        )
    }

    pub fn lookup(
        &self,
        address: &str,
        class_name: &str,
        function_name: &str,
    ) -> Option<Arc<RpcEntry>> {
        self.entries
            .get(&RpcKey::new(address, class_name, function_name))
            .cloned()
    }

    pub fn lookup_packet(&self, packet: &Packet) -> Option<Arc<RpcEntry>> {
        self.entries.get(&RpcKey::of(packet)).cloned()
    }

    /// Re-keys every triple under `old` to `new`. Returns how many moved.
    pub fn remap_address(&mut self, old: &str, new: &str) -> usize {
        if old == new {
            return 0;
        }
        let moved: Vec<RpcKey> = self
            .entries
            .keys()
            .filter(|k| k.address == old)
            .cloned()
            .collect();
        for key in &moved {
            if let Some(entry) = self.entries.remove(key) {
                let mut new_key = key.clone();
                new_key.address = new.to_string();
                self.entries.insert(new_key, entry);
            }
        }
        if !moved.is_empty() {
            tracing::debug!(old, new, count = moved.len(), "Remapped rpc address");
        }
        moved.len()
    }

    /// Decodes the packet's arguments into the entry's buffer and runs the callback.
    pub fn invoke(
        &self,
        entry: &RpcEntry,
        packet: &Packet,
        ctx: &RpcContext,
    ) -> Result<(), NetError> {
        let Some(callback) = &entry.callback else {
            return Err(NetError::NoCallback(entry.function_name.clone()));
        };
        let mut params = entry
            .params
            .lock()
            .map_err(|_| NetError::Poisoned("rpc params"))?;
        params.clear();
        if entry.requires_timestamp {
            params.push(Value::Int(packet.timestamp as i64));
        }
        let result = decode_args_into(&entry.schema, &packet.data, &mut params);
        if result.is_ok() {
            callback(ctx, &params);
        }
        params.clear();
        result
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn noop(name: &str, kind: DispatchKind) -> RpcEntry {
        RpcEntry::new(name, kind, vec![], |_, _| {})
    }

    #[test]
    fn register_then_lookup_then_unregister() {
        let mut reg = RpcRegistry::default();
        reg.register("Player_1", "Pawn", noop("Jump", DispatchKind::ServerOnly))
            .unwrap();

        let found = reg.lookup("Player_1", "Pawn", "Jump").unwrap();
        assert_eq!(found.kind, DispatchKind::ServerOnly);

        assert_eq!(reg.unregister("Player_1", "Pawn", "Jump"), 1);
        assert!(reg.lookup("Player_1", "Pawn", "Jump").is_none());
    }

    #[test]
    fn reregistering_a_triple_replaces_it() {
        let mut reg = RpcRegistry::default();
        reg.register("A", "C", noop("F", DispatchKind::ServerOnly))
            .unwrap();
        let old = reg
            .register("A", "C", noop("F", DispatchKind::ClientOnly))
            .unwrap();
        assert_eq!(old.unwrap().kind, DispatchKind::ServerOnly);
        assert_eq!(reg.len(), 1);
        assert_eq!(
            reg.lookup("A", "C", "F").unwrap().kind,
            DispatchKind::ClientOnly
        );
    }

    #[test]
    fn unregister_cascades_by_granularity() {
        let mut reg = RpcRegistry::default();
        for (addr, class, name) in [
            ("A", "X", "f"),
            ("A", "X", "g"),
            ("A", "Y", "f"),
            ("B", "X", "f"),
        ] {
            reg.register(addr, class, noop(name, DispatchKind::ServerAndClient))
                .unwrap();
        }
        assert_eq!(reg.unregister_class("A", "X"), 2);
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.unregister_address("A"), 1);
        assert!(reg.lookup("B", "X", "f").is_some());
        assert_eq!(reg.unregister("B", "X", "missing"), 0);
    }

    #[test]
    fn capacity_rejects_new_triples_but_allows_replacement() {
        let mut reg = RpcRegistry::new(1);
        reg.register("A", "C", noop("F", DispatchKind::ServerOnly))
            .unwrap();
        assert_eq!(
            reg.register("A", "C", noop("G", DispatchKind::ServerOnly))
                .unwrap_err(),
            NetError::RegistryFull(1)
        );
        assert!(reg
            .register("A", "C", noop("F", DispatchKind::ClientOnly))
            .is_ok());
    }

    #[test]
    fn invoke_decodes_against_schema_and_prepends_timestamp() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let entry = RpcEntry::new(
            "Move",
            DispatchKind::ServerOnly,
            vec![
                ParamKind::Str,
                ParamKind::Struct(vec![ParamKind::Float, ParamKind::Float]),
            ],
            move |_, args| sink.lock().unwrap().extend_from_slice(args),
        )
        .with_timestamp();

        let args = vec![
            Value::Str("north".into()),
            Value::Struct(vec![Value::Float(1.0), Value::Float(-2.5)]),
        ];
        entry.check_args(&args).unwrap();
        let mut packet = Packet::rpc("P", "Pawn", "Move", encode_args(&args));
        packet.timestamp = 42;

        let reg = RpcRegistry::default();
        reg.invoke(
            &entry,
            &packet,
            &RpcContext {
                sender: Some(1),
                timestamp: 42,
            },
        )
        .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], Value::Int(42));
        assert_eq!(&seen[1..], &args[..]);
    }

    #[test]
    fn invoke_rejects_mismatched_payload() {
        let calls = Arc::new(AtomicI64::new(0));
        let counter = calls.clone();
        let entry = RpcEntry::new(
            "Score",
            DispatchKind::ClientOnly,
            vec![ParamKind::Int],
            move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        let reg = RpcRegistry::default();
        let ctx = RpcContext {
            sender: None,
            timestamp: 0,
        };

        let short = Packet::rpc("A", "C", "Score", Bytes::from_static(&[1, 2]));
        assert!(matches!(
            reg.invoke(&entry, &short, &ctx),
            Err(NetError::SchemaMismatch { index: 0, .. })
        ));

        let long = Packet::rpc(
            "A",
            "C",
            "Score",
            encode_args(&[Value::Int(1), Value::Int(2)]),
        );
        assert_eq!(
            reg.invoke(&entry, &long, &ctx),
            Err(NetError::TrailingBytes(8))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn declarations_do_not_execute() {
        let reg = RpcRegistry::default();
        let entry = RpcEntry::declare("Fire", DispatchKind::ServerOnly, vec![]);
        let packet = Packet::rpc("A", "C", "Fire", Bytes::new());
        let ctx = RpcContext {
            sender: None,
            timestamp: 0,
        };
        assert_eq!(
            reg.invoke(&entry, &packet, &ctx),
            Err(NetError::NoCallback("Fire".into()))
        );
    }

    #[test]
    fn remap_moves_all_triples_of_an_address() {
        let mut reg = RpcRegistry::default();
        reg.register("Player_2", "Pawn", noop("Jump", DispatchKind::ServerOnly))
            .unwrap();
        reg.register("Player_2", "Hud", noop("Flash", DispatchKind::ClientOnly))
            .unwrap();
        assert_eq!(reg.remap_address("Player_2", "Player_1"), 2);
        assert!(reg.lookup("Player_2", "Pawn", "Jump").is_none());
        assert!(reg.lookup("Player_1", "Pawn", "Jump").is_some());
        assert!(reg.lookup("Player_1", "Hud", "Flash").is_some());
    }

    #[test]
    fn check_args_catches_wrong_kinds() {
        let entry = RpcEntry::declare("Say", DispatchKind::ServerOnly, vec![ParamKind::Str]);
        assert!(entry.check_args(&[Value::Str("hi".into())]).is_ok());
        assert!(entry.check_args(&[Value::Int(1)]).is_err());
        assert!(entry.check_args(&[]).is_err());
    }
}
