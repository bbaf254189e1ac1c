mod helpers;

mod cli;
mod membership;
mod requests;
