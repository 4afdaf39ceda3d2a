//! Parameter model: typed, named values with Constant, Getter and Setter roles.
//!
//! Parameters are connected into groups. A group is either one Getter feeding
//! any number of Setters, or a fully connected mesh of Constants and Setters
//! where setting any member sets all of them.
//!
//! # Example
//!
//! ```ignore
//! let gain = graph.parameter(amp, "gain").unwrap();
//! let level = graph.parameter(meter, "level").unwrap();
//! graph.connect_parameters(level, gain)?;
//! ```

#![forbid(unsafe_code)]

use crate::error::ParamError;
use crate::graph::BlockId;
use crate::invariant_ppt::{assert_invariant, PARAM_GROUP_VALID};
use crate::trigger::TriggerId;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Name of the implicit constant every block carries.
pub const OUTPUT_MAX_WRITE: &str = "OutputMaxWrite";

/// Handle to a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(pub usize);

/// Role of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Set while the graph is paused; pushed to its group.
    Constant,
    /// Produced by its block at flow time; pushed to connected Setters.
    Getter,
    /// Consumed by its block through `Block::set_parameter`.
    Setter,
}

impl ParamKind {
    pub fn name(self) -> &'static str {
        match self {
            ParamKind::Constant => "constant",
            ParamKind::Getter => "getter",
            ParamKind::Setter => "setter",
        }
    }
}

/// Element type of a parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Bool,
    Int,
    Uint,
    Double,
    Text,
}

/// A parameter value: a fixed-length array of one element type, or text.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Bool(Vec<bool>),
    Int(Vec<i64>),
    Uint(Vec<u64>),
    Double(Vec<f64>),
    Text(String),
}

impl ParamValue {
    /// A zeroed value of the given type and length.
    pub fn zero(ty: ParamType, len: usize) -> Self {
        match ty {
            ParamType::Bool => ParamValue::Bool(vec![false; len]),
            ParamType::Int => ParamValue::Int(vec![0; len]),
            ParamType::Uint => ParamValue::Uint(vec![0; len]),
            ParamType::Double => ParamValue::Double(vec![0.0; len]),
            ParamType::Text => ParamValue::Text(String::new()),
        }
    }

    pub fn ty(&self) -> ParamType {
        match self {
            ParamValue::Bool(_) => ParamType::Bool,
            ParamValue::Int(_) => ParamType::Int,
            ParamValue::Uint(_) => ParamType::Uint,
            ParamValue::Double(_) => ParamType::Double,
            ParamValue::Text(_) => ParamType::Text,
        }
    }

    /// Number of elements; text counts as one.
    pub fn len(&self) -> usize {
        match self {
            ParamValue::Bool(v) => v.len(),
            ParamValue::Int(v) => v.len(),
            ParamValue::Uint(v) => v.len(),
            ParamValue::Double(v) => v.len(),
            ParamValue::Text(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => v.first().copied(),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => v.first().copied(),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            ParamValue::Uint(v) => v.first().copied(),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            ParamValue::Double(v) => v.first().copied(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(vec![v])
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(vec![v])
    }
}

impl From<u64> for ParamValue {
    fn from(v: u64) -> Self {
        ParamValue::Uint(vec![v])
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Double(vec![v])
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

impl From<Vec<f64>> for ParamValue {
    fn from(v: Vec<f64>) -> Self {
        ParamValue::Double(v)
    }
}

/// Static description of a parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamInfo {
    pub id: ParamId,
    pub block: BlockId,
    pub name: String,
    pub kind: ParamKind,
    pub ty: ParamType,
    pub len: usize,
}

pub(crate) struct ParamEntry {
    pub(crate) info: ParamInfo,
    pub(crate) block_name: String,
    pub(crate) value: Arc<Mutex<ParamValue>>,
    pub(crate) group: Option<usize>,
    /// Setter inbox; values pushed at flow time wait here until the
    /// setter's trigger runs on the owning block's worker.
    pub(crate) inbox: Option<(Sender<ParamValue>, Receiver<ParamValue>)>,
    pub(crate) trigger: Option<TriggerId>,
}

impl ParamEntry {
    fn label(&self) -> String {
        format!("{}:{}", self.block_name, self.info.name)
    }

    fn check_value(&self, value: &ParamValue) -> Result<(), ParamError> {
        let len_ok = self.info.ty == ParamType::Text || value.len() == self.info.len;
        if value.ty() != self.info.ty || !len_ok {
            return Err(ParamError::TypeMismatch {
                name: self.label(),
                expected: self.info.ty,
                len: self.info.len,
                got: value.ty(),
                got_len: value.len(),
            });
        }
        Ok(())
    }
}

/// Registry of every parameter in a graph and its connection groups.
#[derive(Default)]
pub(crate) struct ParamRegistry {
    entries: Vec<Option<ParamEntry>>,
    groups: HashMap<usize, Vec<ParamId>>,
    next_group: usize,
    by_name: HashMap<(BlockId, String), ParamId>,
}

impl ParamRegistry {
    pub(crate) fn declare(
        &mut self,
        block: BlockId,
        block_name: &str,
        name: &str,
        kind: ParamKind,
        initial: ParamValue,
    ) -> Result<ParamId, ParamError> {
        let key = (block, name.to_string());
        if self.by_name.contains_key(&key) {
            return Err(ParamError::Duplicate(format!("{block_name}:{name}")));
        }
        let id = ParamId(self.entries.len());
        let inbox = (kind == ParamKind::Setter).then(crossbeam_channel::unbounded);
        self.entries.push(Some(ParamEntry {
            info: ParamInfo {
                id,
                block,
                name: name.to_string(),
                kind,
                ty: initial.ty(),
                len: initial.len(),
            },
            block_name: block_name.to_string(),
            value: Arc::new(Mutex::new(initial)),
            group: None,
            inbox,
            trigger: None,
        }));
        self.by_name.insert(key, id);
        Ok(id)
    }

    pub(crate) fn bind_trigger(&mut self, id: ParamId, trigger: TriggerId) {
        if let Some(Some(entry)) = self.entries.get_mut(id.0) {
            entry.trigger = Some(trigger);
        }
    }

    pub(crate) fn lookup(&self, block: BlockId, name: &str) -> Option<ParamId> {
        self.by_name.get(&(block, name.to_string())).copied()
    }

    pub(crate) fn entry(&self, id: ParamId) -> Result<&ParamEntry, ParamError> {
        self.entries
            .get(id.0)
            .and_then(|e| e.as_ref())
            .ok_or(ParamError::InvalidId(id.0))
    }

    pub(crate) fn info(&self, id: ParamId) -> Result<ParamInfo, ParamError> {
        self.entry(id).map(|e| e.info.clone())
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &ParamEntry> {
        self.entries.iter().flatten()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn for_block(&self, block: BlockId) -> Vec<ParamId> {
        self.entries()
            .filter(|e| e.info.block == block)
            .map(|e| e.info.id)
            .collect()
    }

    pub(crate) fn get(&self, id: ParamId) -> Result<ParamValue, ParamError> {
        Ok(self.entry(id)?.value.lock().clone())
    }

    /// Members of `id`'s group other than `id` itself.
    pub(crate) fn peers(&self, id: ParamId) -> Vec<ParamId> {
        let Ok(entry) = self.entry(id) else {
            return Vec::new();
        };
        entry
            .group
            .and_then(|g| self.groups.get(&g))
            .map(|members| members.iter().copied().filter(|m| *m != id).collect())
            .unwrap_or_default()
    }

    fn members(&self, id: ParamId) -> Vec<ParamId> {
        let mut members = self.peers(id);
        members.push(id);
        members
    }

    /// Merge the groups of `a` and `b`.
    pub(crate) fn connect(&mut self, a: ParamId, b: ParamId) -> Result<(), ParamError> {
        let ea = self.entry(a)?;
        let eb = self.entry(b)?;
        if a == b {
            return Err(ParamError::BadConnection {
                a: ea.label(),
                b: eb.label(),
                reason: "a parameter cannot connect to itself",
            });
        }
        if ea.group.is_some() && ea.group == eb.group {
            return Ok(());
        }
        let bad = |reason| ParamError::BadConnection {
            a: ea.label(),
            b: eb.label(),
            reason,
        };

        let mut merged = self.members(a);
        merged.extend(self.members(b));
        let mut getters = 0;
        let mut constants = 0;
        for id in &merged {
            let entry = self.entry(*id)?;
            if entry.info.ty != ea.info.ty || entry.info.len != ea.info.len {
                return Err(bad("value types differ"));
            }
            match entry.info.kind {
                ParamKind::Getter => getters += 1,
                ParamKind::Constant => constants += 1,
                ParamKind::Setter => {}
            }
        }
        if getters > 1 {
            return Err(bad("a group may hold only one getter"));
        }
        if getters == 1 && constants > 0 {
            return Err(bad("a getter group may only feed setters"));
        }
        assert_invariant(
            PARAM_GROUP_VALID,
            getters <= 1,
            "group has a single getter",
            Some("connect"),
        );

        for old in [self.entry(a)?.group, self.entry(b)?.group].into_iter().flatten() {
            self.groups.remove(&old);
        }
        let group = self.next_group;
        self.next_group += 1;
        for id in &merged {
            if let Some(Some(entry)) = self.entries.get_mut(id.0) {
                entry.group = Some(group);
            }
        }
        self.groups.insert(group, merged);
        Ok(())
    }

    /// Remove `id` from its group.
    pub(crate) fn disconnect(&mut self, id: ParamId) -> Result<(), ParamError> {
        let Some(group) = self.entry(id)?.group else {
            return Ok(());
        };
        if let Some(Some(entry)) = self.entries.get_mut(id.0) {
            entry.group = None;
        }
        let remaining: Vec<ParamId> = self
            .groups
            .remove(&group)
            .unwrap_or_default()
            .into_iter()
            .filter(|m| *m != id)
            .collect();
        if remaining.len() > 1 {
            self.groups.insert(group, remaining);
        } else {
            for m in remaining {
                if let Some(Some(entry)) = self.entries.get_mut(m.0) {
                    entry.group = None;
                }
            }
        }
        Ok(())
    }

    /// Drop every parameter of a removed block.
    pub(crate) fn remove_block(&mut self, block: BlockId) -> Result<(), ParamError> {
        for id in self.for_block(block) {
            self.disconnect(id)?;
            if let Some(slot) = self.entries.get_mut(id.0) {
                if let Some(entry) = slot.take() {
                    self.by_name.remove(&(block, entry.info.name));
                }
            }
        }
        Ok(())
    }

    /// Store a paused-time value into `id`, and into its whole group when
    /// that group is a Constant/Setter mesh. A Setter fed by a Getter takes
    /// the value alone; the Getter and its other Setters keep theirs.
    ///
    /// Returns the Constants and Setters whose blocks must be told.
    pub(crate) fn set_paused(
        &self,
        id: ParamId,
        value: &ParamValue,
    ) -> Result<Vec<ParamId>, ParamError> {
        let entry = self.entry(id)?;
        if entry.info.kind == ParamKind::Getter {
            return Err(ParamError::WrongKind {
                name: entry.label(),
                kind: entry.info.kind.name(),
                operation: "set",
            });
        }
        entry.check_value(value)?;
        let members = self.members(id);
        let mut fed = false;
        for member in &members {
            fed |= self.entry(*member)?.info.kind == ParamKind::Getter;
        }
        let targets = if fed { vec![id] } else { members };
        for member in &targets {
            *self.entry(*member)?.value.lock() = value.clone();
        }
        Ok(targets)
    }

    /// Build the run-time table handed to workers.
    pub(crate) fn snapshot(&self) -> ParamTable {
        let links = self
            .entries
            .iter()
            .map(|slot| {
                slot.as_ref().map(|e| ParamLink {
                    info: e.info.clone(),
                    label: e.label(),
                    value: Arc::clone(&e.value),
                    inbox: e.inbox.clone(),
                    trigger: e.trigger,
                    peers: self.peers(e.info.id),
                })
            })
            .collect();
        ParamTable { links }
    }

    /// Throw away setter values that were pushed but never delivered.
    pub(crate) fn drain_inboxes(&self) -> usize {
        self.entries()
            .filter_map(|e| e.inbox.as_ref())
            .map(|(_, rx)| rx.try_iter().count())
            .sum()
    }
}

/// Run-time view of one parameter.
pub(crate) struct ParamLink {
    pub(crate) info: ParamInfo,
    pub(crate) label: String,
    pub(crate) value: Arc<Mutex<ParamValue>>,
    pub(crate) inbox: Option<(Sender<ParamValue>, Receiver<ParamValue>)>,
    pub(crate) trigger: Option<TriggerId>,
    pub(crate) peers: Vec<ParamId>,
}

/// Immutable parameter topology for one run. Values stay shared with the
/// graph's registry.
pub(crate) struct ParamTable {
    links: Vec<Option<ParamLink>>,
}

impl ParamTable {
    pub(crate) fn link(&self, id: ParamId) -> Result<&ParamLink, ParamError> {
        self.links
            .get(id.0)
            .and_then(|l| l.as_ref())
            .ok_or(ParamError::InvalidId(id.0))
    }

    /// Validate and store a getter push, returning the setters to feed.
    pub(crate) fn prepare_push(
        &self,
        owner: BlockId,
        id: ParamId,
        value: &ParamValue,
    ) -> Result<Vec<(&ParamLink, TriggerId)>, ParamError> {
        let link = self.link(id)?;
        if link.info.kind != ParamKind::Getter || link.info.block != owner {
            return Err(ParamError::WrongKind {
                name: link.label.clone(),
                kind: link.info.kind.name(),
                operation: "pushed by this block",
            });
        }
        check_link_value(link, value)?;
        *link.value.lock() = value.clone();
        let mut targets = Vec::with_capacity(link.peers.len());
        for peer in &link.peers {
            let setter = self.link(*peer)?;
            if let (Some((tx, _)), Some(trigger)) = (&setter.inbox, setter.trigger) {
                if tx.send(value.clone()).is_ok() {
                    targets.push((setter, trigger));
                }
            }
        }
        Ok(targets)
    }

    /// Queue a value for a setter while the graph is flowing.
    pub(crate) fn prepare_setter(
        &self,
        id: ParamId,
        value: &ParamValue,
    ) -> Result<(&ParamLink, TriggerId), ParamError> {
        let link = self.link(id)?;
        let wrong = || ParamError::WrongKind {
            name: link.label.clone(),
            kind: link.info.kind.name(),
            operation: "set while flowing",
        };
        match link.info.kind {
            ParamKind::Constant => return Err(ParamError::NotPaused),
            ParamKind::Getter => return Err(wrong()),
            ParamKind::Setter => {}
        }
        check_link_value(link, value)?;
        *link.value.lock() = value.clone();
        match (&link.inbox, link.trigger) {
            (Some((tx, _)), Some(trigger)) if tx.send(value.clone()).is_ok() => {
                Ok((link, trigger))
            }
            _ => Err(wrong()),
        }
    }
}

fn check_link_value(link: &ParamLink, value: &ParamValue) -> Result<(), ParamError> {
    let len_ok = link.info.ty == ParamType::Text || value.len() == link.info.len;
    if value.ty() != link.info.ty || !len_ok {
        return Err(ParamError::TypeMismatch {
            name: link.label.clone(),
            expected: link.info.ty,
            len: link.info.len,
            got: value.ty(),
            got_len: value.len(),
        });
    }
    Ok(())
}
