pub mod read_item;
pub mod set_power_limit;
pub mod write_number;
pub mod write_pilot_power;
pub mod write_switch;
