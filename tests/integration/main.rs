mod renewal_flow;
mod support;
