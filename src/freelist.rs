use std::ptr::NonNull;

use crate::{
    block::Block,
    header::Header,
    list::{LinkedList, Node},
};

/// When a block is free its payload is unused by the caller, so we store the
/// free list links there. The free list is a [`LinkedList<()>`] whose nodes
/// live at the payload address of each free block:
///
/// ```text
/// +----------------------------+
/// |       Header<Block>        |  address-order links + metadata
/// +----------------------------+
/// | pointer to next free block |  <--+
/// | pointer to prev free block |     |  Node<()> written in the payload
/// +----------------------------+  <--+
/// |    rest of the payload     |
/// +----------------------------+
/// ```
///
/// A `Node<()>` can only point to other `Node<()>`, so the free list holds
/// payload addresses, not header addresses; to get back to the block header
/// subtract the padded header size. The minimum payload guarantees the node
/// always fits, see [`crate::block::min_payload`].
pub(crate) type FreeListNode = Node<()>;

/// See [`FreeListNode`].
pub(crate) type FreeList = LinkedList<()>;

impl Header<Block> {
    /// Returns the block header that owns a free list node. `offset` is the
    /// padded header size of the heap the block belongs to.
    #[inline]
    pub unsafe fn from_free_list_node(node: NonNull<FreeListNode>, offset: usize) -> NonNull<Self> {
        Self::from_payload_address(node.cast(), offset)
    }
}

impl FreeList {
    /// Links `block` into the free list and marks it free. `offset` is the
    /// padded header size of the owning heap.
    pub unsafe fn append_block(&mut self, mut block: NonNull<Header<Block>>, offset: usize) {
        self.append((), Header::payload_address_of(block, offset));
        block.as_mut().data.is_free = true;
    }

    /// Unlinks `block` from the free list and marks it allocated.
    pub unsafe fn remove_block(&mut self, mut block: NonNull<Header<Block>>, offset: usize) {
        self.remove(Header::payload_address_of(block, offset).cast());
        block.as_mut().data.is_free = false;
    }

    /// Iterates over the block headers of all free blocks.
    pub unsafe fn iter_blocks(
        &self,
        offset: usize,
    ) -> impl Iterator<Item = NonNull<Header<Block>>> + '_ {
        self.iter()
            .map(move |node| Header::<Block>::from_free_list_node(node, offset))
    }
}
