//! Glue between a store buffer and the tensor descriptor aliasing it.

use super::metadata::TensorHeader;
use crate::error::Result;
use crate::observability::{record_delete, record_failure, record_release};
use crate::store::{ObjectBuffer, ObjectId, StoreSession};
use crate::tensor::{Deleter, ManagedTensor, TensorDescriptor, row_major_strides};
use std::fmt;
use std::sync::Arc;

/// What a store-backed tensor does to its object when it is let go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeletionPolicy {
    /// Release the local mapping. The object stays resident for other readers.
    #[default]
    ReleaseOnly,
    /// Release the local mapping, then delete the object.
    ///
    /// Only for the last intended consumer.
    ReleaseAndDelete,
}

/// Ties one client reference on a store object to the session that owns it.
///
/// The context is consumed by the [`Deleter`] it becomes, so the reference
/// it represents is given back exactly once.
pub struct StoreBridgeContext {
    session: Arc<StoreSession>,
    id: ObjectId,
    buffer: ObjectBuffer,
}

impl StoreBridgeContext {
    pub(crate) fn new(session: Arc<StoreSession>, id: ObjectId, buffer: ObjectBuffer) -> Self {
        Self { session, id, buffer }
    }

    /// Object this context holds a reference on.
    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// The mapped payload buffer.
    #[inline]
    pub fn buffer(&self) -> ObjectBuffer {
        self.buffer
    }

    /// Endpoint of the session the reference belongs to.
    pub fn endpoint(&self) -> &str {
        self.session.endpoint()
    }

    /// Give the reference back to the store.
    ///
    /// # Errors
    ///
    /// Store failures propagate unchanged ([`Error::DoubleRelease`],
    /// [`Error::NotFound`], [`Error::Disconnected`]).
    ///
    /// [`Error::DoubleRelease`]: crate::Error::DoubleRelease
    /// [`Error::NotFound`]: crate::Error::NotFound
    /// [`Error::Disconnected`]: crate::Error::Disconnected
    pub fn release(&self) -> Result<()> {
        match self.session.client().release(self.id) {
            Ok(()) => {
                record_release(self.session.endpoint());
                tracing::debug!(id = %self.id, "released store mapping");
                Ok(())
            }
            Err(e) => {
                record_failure(self.session.endpoint(), "release", e.kind());
                Err(e)
            }
        }
    }

    /// Ask the store to remove the object.
    ///
    /// # Errors
    ///
    /// Store failures propagate unchanged.
    pub fn delete(&self) -> Result<()> {
        match self.session.client().delete(self.id) {
            Ok(()) => {
                record_delete(self.session.endpoint());
                tracing::debug!(id = %self.id, "deleted store object");
                Ok(())
            }
            Err(e) => {
                record_failure(self.session.endpoint(), "delete", e.kind());
                Err(e)
            }
        }
    }

    pub(crate) fn seal(&self) -> Result<()> {
        self.session.client().seal(self.id)
    }

    /// Turn the context into the deleter selected by `policy`.
    pub fn into_deleter(self, policy: DeletionPolicy) -> Deleter {
        match policy {
            DeletionPolicy::ReleaseOnly => Deleter::ReleaseOnly(self),
            DeletionPolicy::ReleaseAndDelete => Deleter::ReleaseAndDelete(self),
        }
    }

    /// Wrap the buffer in a row-major descriptor described by `header`.
    ///
    /// # Safety
    ///
    /// The buffer must hold at least `header`'s byte size, and this context
    /// must own a live reference on the object.
    pub(crate) unsafe fn into_managed(self, header: &TensorHeader, policy: DeletionPolicy) -> ManagedTensor {
        let mut desc = TensorDescriptor::new(self.buffer.as_ptr(), header.device, header.dtype, &header.shape);
        desc.strides = Some(row_major_strides(&header.shape));
        // SAFETY: caller contract; the deleter keeps the reference until it fires.
        unsafe { ManagedTensor::new(desc, self.into_deleter(policy)) }
    }
}

impl fmt::Debug for StoreBridgeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreBridgeContext")
            .field("endpoint", &self.session.endpoint())
            .field("id", &self.id)
            .field("len", &self.buffer.len())
            .finish()
    }
}
