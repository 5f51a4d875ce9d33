pub mod gateway_notification;
pub mod order;
pub mod order_line_item;
pub mod payment;
pub mod product;
