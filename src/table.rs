//! # Page Table Nodes
//!
//! The radix tree that maps an entry's logical page index to physical pages
//! is built from `PageTable` nodes. A node is either a *leaf* (height 0)
//! whose children are physical pages, or an *interior* node (height >= 1)
//! whose children are other nodes, never both. Children always occupy the
//! lowest indices contiguously; a gap is a bug, not a state.
//!
//! ## Marshalled Node Layout
//!
//! Every node owns one backing physical page holding its pointer list:
//!
//! ```text
//! Offset  Size   Description
//! ------  -----  ----------------------------------------
//! 0       8      count: number of children (u64, LE)
//! 8       8*N    child file offsets (i64, LE)
//! ```
//!
//! With 4096-byte pages this caps a node at (4096 - 8) / 8 = 511 children,
//! which is the tree fan-out. Every structural mutation rewrites the
//! marshalled form before returning, so the on-disk tree is never behind the
//! in-memory one by more than the mutation in flight.
//!
//! ## Arena Allocation
//!
//! Parent and child reference each other, so nodes live in a `NodeArena`
//! and refer to each other by `NodeId`. Ownership resides in the arena;
//! removing a node frees its slot for reuse but never touches siblings.

use std::sync::Arc;

use eyre::{ensure, Result};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::FAN_OUT;
use crate::physical::PhysicalPage;

pub const NODE_HEADER_SIZE: usize = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct NodeHeader {
    count: U64,
}

const _: () = assert!(std::mem::size_of::<NodeHeader>() == NODE_HEADER_SIZE);

/// Stable handle to a node inside its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(u32);

#[derive(Debug)]
pub enum Children {
    Pages(Vec<Arc<PhysicalPage>>),
    Tables(Vec<NodeId>),
}

#[derive(Debug)]
pub struct PageTable {
    height: u32,
    parent: Option<NodeId>,
    backing: Arc<PhysicalPage>,
    children: Children,
}

impl PageTable {
    pub fn new(height: u32, parent: Option<NodeId>, backing: Arc<PhysicalPage>) -> Self {
        let children = if height == 0 {
            Children::Pages(Vec::new())
        } else {
            Children::Tables(Vec::new())
        };
        Self {
            height,
            parent,
            backing,
            children,
        }
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn set_parent(&mut self, parent: Option<NodeId>) {
        self.parent = parent;
    }

    pub fn backing(&self) -> &Arc<PhysicalPage> {
        &self.backing
    }

    pub fn child_count(&self) -> usize {
        match &self.children {
            Children::Pages(pages) => pages.len(),
            Children::Tables(tables) => tables.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.child_count() == 0
    }

    pub fn pages(&self) -> &Vec<Arc<PhysicalPage>> {
        match &self.children {
            Children::Pages(pages) => pages,
            Children::Tables(_) => panic!("interior node treated as a leaf"),
        }
    }

    pub fn pages_mut(&mut self) -> &mut Vec<Arc<PhysicalPage>> {
        match &mut self.children {
            Children::Pages(pages) => pages,
            Children::Tables(_) => panic!("interior node treated as a leaf"),
        }
    }

    pub fn tables(&self) -> &Vec<NodeId> {
        match &self.children {
            Children::Pages(_) => panic!("leaf node treated as interior"),
            Children::Tables(tables) => tables,
        }
    }

    pub fn tables_mut(&mut self) -> &mut Vec<NodeId> {
        match &mut self.children {
            Children::Pages(_) => panic!("leaf node treated as interior"),
            Children::Tables(tables) => tables,
        }
    }
}

#[derive(Debug, Default)]
pub struct NodeArena {
    nodes: Vec<Option<PageTable>>,
    free: Vec<u32>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: PageTable) -> NodeId {
        if let Some(slot) = self.free.pop() {
            self.nodes[slot as usize] = Some(node);
            return NodeId(slot);
        }
        self.nodes.push(Some(node));
        NodeId((self.nodes.len() - 1) as u32)
    }

    pub fn remove(&mut self, id: NodeId) -> PageTable {
        let node = self.nodes[id.0 as usize]
            .take()
            .expect("removed a node that is not in the arena");
        self.free.push(id.0);
        node
    }

    pub fn get(&self, id: NodeId) -> &PageTable {
        self.nodes[id.0 as usize]
            .as_ref()
            .expect("dangling node id")
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut PageTable {
        self.nodes[id.0 as usize]
            .as_mut()
            .expect("dangling node id")
    }

    /// Serializes a node's pointer list into its marshalled on-disk form.
    pub fn marshal(&self, id: NodeId) -> Vec<u8> {
        let node = self.get(id);
        let count = node.child_count();
        assert!(
            count as i64 <= FAN_OUT,
            "node has {count} children, fan-out is {FAN_OUT}"
        );

        let mut buf = Vec::with_capacity(NODE_HEADER_SIZE + count * 8);
        let header = NodeHeader {
            count: U64::new(count as u64),
        };
        buf.extend_from_slice(header.as_bytes());
        match &node.children {
            Children::Pages(pages) => {
                for page in pages {
                    buf.extend_from_slice(&page.file_off().to_le_bytes());
                }
            }
            Children::Tables(tables) => {
                for &table in tables {
                    buf.extend_from_slice(&self.get(table).backing.file_off().to_le_bytes());
                }
            }
        }
        buf
    }

    /// Marshals a node and writes it to the node's backing page.
    pub fn write_node(&self, id: NodeId) -> Result<()> {
        let data = self.marshal(id);
        self.get(id).backing.write_at(&data, 0)?;
        Ok(())
    }
}

/// Parses a marshalled pointer list back into child file offsets.
pub fn parse_node(data: &[u8]) -> Result<Vec<i64>> {
    ensure!(
        data.len() >= NODE_HEADER_SIZE,
        "marshalled node too short: {} bytes",
        data.len()
    );

    let header = NodeHeader::ref_from_bytes(&data[..NODE_HEADER_SIZE])
        .map_err(|e| eyre::eyre!("failed to parse node header: {:?}", e))?;
    let count = header.count.get();
    ensure!(
        count as i64 <= FAN_OUT,
        "marshalled node claims {} children, fan-out is {}",
        count,
        FAN_OUT
    );
    ensure!(
        data.len() - NODE_HEADER_SIZE >= count as usize * 8,
        "marshalled node truncated: {} children, {} bytes of offsets",
        count,
        data.len() - NODE_HEADER_SIZE
    );

    let mut offsets = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let start = NODE_HEADER_SIZE + i * 8;
        let raw: [u8; 8] = data[start..start + 8].try_into().unwrap();
        offsets.push(i64::from_le_bytes(raw));
    }
    Ok(offsets)
}
