//! tessel-runtime — Runtime tessel au-dessus de la VM
//!
//! - `hal`          : pilotes, devices, allocateur, buffers device, module VM `hal`.
//! - `host_types`   : pont hôte (vues strided sans copie sur mémoire mappée).
//! - `function_abi` : convention d’appel dérivée de la réflexion (`f`, `fv`).
//! - `system`       : `Config`, `SystemContext`, modules et fonctions liés.
//! - `shaped`       : chaînes `[2x2]f32=...` pour les outils en ligne de commande.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

pub mod function_abi;
pub mod hal;
pub mod host_types;
pub mod shaped;
pub mod system;

pub use function_abi::FunctionAbi;
pub use hal::{BufferUsage, BufferView, DeviceBuffer, HalAllocator, HalDevice, HalDriver, MappedMemory, MemoryType};
pub use host_types::{Description, HostArray, HostTypeFactory, HostValue, NdarrayHostTypeFactory};
pub use shaped::ShapedBuffer;
pub use system::{load_module, load_modules, BoundFunction, BoundModule, Config, Returned, SystemContext};
