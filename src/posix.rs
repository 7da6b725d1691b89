/// POSIX style error numbers (subset) returned through the hypercall ABI.
pub mod errno {
    pub const EPERM: i32 = 1; // Operation not permitted
    pub const ESRCH: i32 = 3; // No such process
    pub const ENOMEM: i32 = 12; // Out of memory
    pub const EFAULT: i32 = 14; // Bad address
    pub const EBUSY: i32 = 16; // Device or resource busy
    pub const EINVAL: i32 = 22; // Invalid argument
    pub const ENOSYS: i32 = 38; // Function not implemented
}
