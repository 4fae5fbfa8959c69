use std::ptr::NonNull;

use crate::list::Node;

/// Since all the headers we store point to their previous and next header we
/// might as well consider them linked list nodes. This is just a type alias
/// that we use when we want to refer to a block header without thinking about
/// linked list nodes.
pub(crate) type Header<T> = Node<T>;

impl<T> Header<T> {
    /// Returns a pointer to the [`Header<T>`] that sits `offset` bytes before
    /// `address`:
    ///
    /// ```text
    /// +-------------+
    /// |  Header<T>  | <- Returned pointer points here.
    /// +-------------+
    /// |   padding   |    (offset includes header size plus padding)
    /// +-------------+
    /// |   Payload   | <- Given address points here.
    /// +-------------+
    /// ```
    ///
    /// The offset is a runtime value because block payloads are padded out to
    /// the pool alignment, see [`crate::block::padded_header_size`].
    ///
    /// # Safety
    ///
    /// Caller must guarantee that a valid header was actually written
    /// `offset` bytes before `address`.
    #[inline]
    pub unsafe fn from_payload_address(address: NonNull<u8>, offset: usize) -> NonNull<Self> {
        NonNull::new_unchecked(address.as_ptr().sub(offset).cast::<Self>())
    }

    /// Returns the payload address of `header`, which starts `offset` bytes
    /// after the header itself. Inverse of [`Header::from_payload_address`].
    ///
    /// # Notes
    ///
    /// We use this as `Header::payload_address_of(header, offset)` instead of
    /// `header.payload_address()` to avoid creating intermediary references
    /// to `self`, which keeps Miri and Stacked Borrows happy.
    #[inline]
    pub unsafe fn payload_address_of(header: NonNull<Self>, offset: usize) -> NonNull<u8> {
        NonNull::new_unchecked(header.as_ptr().cast::<u8>().add(offset))
    }
}
