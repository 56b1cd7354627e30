use std::ffi::c_void;

use cudarc::driver::SyncOnDrop;

use crate::cuda::storage::DeviceTensor;

/// Brackets a group of native calls that touch a set of device tensors.
///
/// Construction is the "prepare" step; `read`/`write` hand out device
/// addresses and record the read/write intent through the stream-ordering
/// guards; `register` (or drop) releases every guard at once. One prepare and
/// one register per operation group, however many native calls run in
/// between; the addresses stay valid for the action's whole lifetime.
pub struct PreparedAction<'a> {
    guards: Vec<SyncOnDrop<'a>>,
}

impl<'a> PreparedAction<'a> {
    pub fn prepare() -> Self {
        Self { guards: Vec::new() }
    }

    /// Device address of a tensor this group reads.
    pub fn read(&mut self, tensor: &'a DeviceTensor) -> *const c_void {
        let (ptr, guard) = tensor.ptr();
        self.guards.push(guard);
        ptr
    }

    /// Device address of a tensor this group writes.
    pub fn write(&mut self, tensor: &'a mut DeviceTensor) -> *mut c_void {
        let (ptr, guard) = tensor.ptr_mut();
        self.guards.push(guard);
        ptr
    }

    /// Mark the group complete and release the synchronization guards.
    pub fn register(self) {}
}
