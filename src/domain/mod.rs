//! Domain Layer
//!
//! Value objects shared by every component and the ports (traits) through
//! which the core reaches its collaborators.
//!
//! - **Ports** (`ports.rs`) - `KeyValueStore`, `Loader`, `VoucherStore`
//! - **Value objects** - `UserId`, `VoucherId`, `GeneratedId`, `SeckillVoucher`,
//!   `VoucherOrder`, `RequestContext`

pub mod ports;

pub use ports::{
    // Port traits
    KeyValueStore,
    Loader,
    OrderTransaction,
    VoucherStore,
    // Value objects
    GeneratedId,
    RequestContext,
    SeckillVoucher,
    UserId,
    VoucherId,
    VoucherOrder,
    ID_EPOCH_SECONDS,
    SEQUENCE_BITS,
};
