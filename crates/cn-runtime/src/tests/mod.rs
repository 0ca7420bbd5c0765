//! End-to-end scenarios: in-process control nodes wired over real UDP
//! sockets, driven through the same ingress ports production uses.
