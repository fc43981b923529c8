pub mod mock_cortex;
