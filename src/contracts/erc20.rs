use ethers::prelude::*;

// Settlement-asset (USDC) ABI
abigen!(
    IERC20,
    r#"[
        function transfer(address to, uint256 amount) external returns (bool)
        function balanceOf(address account) external view returns (uint256)
        function decimals() external view returns (uint8)
    ]"#
);

/// keccak256("Transfer(address,address,uint256)")
pub fn transfer_topic() -> H256 {
    H256::from(ethers::utils::keccak256("Transfer(address,address,uint256)"))
}
