pub mod approval;
pub mod mandate;
pub mod merchant;
pub mod payment;
pub mod signer;

pub use approval::{ApprovalChannel, ApprovalGate, ApprovalRequest, DenyAll, TerminalApproval};
pub use mandate::{validate_cart, MandateFlow};
pub use merchant::{HttpMerchantGateway, MerchantGateway};
pub use payment::{
    Authorization, FetchOptions, FetchOutcome, PaymentClient, Settlement, SettlementRequest,
};
pub use signer::{sign_mandate, verify_mandate, PaymentSigner, TransferOutcome, WalletSigner};
