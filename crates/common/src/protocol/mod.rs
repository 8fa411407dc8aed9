// Wire protocol shared by client sockets and the cross-process bus.

pub mod ws;
