mod session;
mod supervisor;
