//! tessel-vm — Machine virtuelle tessel
//!
//! - `VmInstance` : ancre process (types intégrés enregistrés une fois).
//! - `VmModule` : module bytecode (depuis un `ModuleBuffer`) ou natif.
//! - `VmContext` : ensemble ordonné de modules, ouvert ou fermé.
//! - `VmContext::invoke` : exécution synchrone sur le thread appelant.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

pub mod context;
pub mod instance;
mod interp;
pub mod module;
pub mod refs;
pub mod status;
pub mod variant;

pub use context::VmContext;
pub use instance::VmInstance;
pub use interp::MAX_CALL_DEPTH;
pub use module::{Linkage, ModuleBuffer, NativeFunction, NativeModuleBuilder, ReflectionAttrs, VmFunction, VmModule};
pub use refs::{RefObject, RefTypeId, RefTypeSlot, RoByteBuffer, VmRef};
pub use status::{Status, StatusCode, VmResult};
pub use variant::{Variant, VariantList};
