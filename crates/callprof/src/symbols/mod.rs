mod dwarf;
mod resolver;

pub use dwarf::{AddressRange, DebugInfo, FunctionSymbol};
pub use resolver::SymbolResolver;
