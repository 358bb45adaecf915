pub mod amount;
pub mod ledger;
pub mod mandate;
pub mod payment;
pub mod policy;
pub mod scan;

pub use amount::*;
pub use ledger::*;
pub use mandate::*;
pub use payment::*;
pub use policy::*;
pub use scan::*;
