pub mod ptp;
pub mod sap;
