pub mod ethernet_hub;
